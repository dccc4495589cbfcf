//! Top-level conversion run
//!
//! Scans the local archive for inputs inside the window, starts the external
//! converter, and runs a [`ConversionMonitor`] on its cache directory until
//! every station is accounted or the grace period after the processes exit
//! runs out.

use crate::cancel::CancellationController;
use crate::config::Config;
use crate::converter::{ConversionJob, ConverterLauncher, WctLauncher};
use crate::error::{Error, Result};
use crate::layout::{LocalLayout, list_data_files, parse_scan_time};
use crate::log_aggregator::{LogAggregator, LogHandle, TracingSink};
use crate::monitor::{ConversionMonitor, MonitorReport, StationProgress};
use crate::report::SummaryTable;
use crate::types::{DateRange, StationId};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Everything a conversion run produced
#[derive(Clone, Debug)]
pub struct ConversionSummary {
    /// Final per-station state from the monitor
    pub report: MonitorReport,
    /// Every converter process exited cleanly
    pub processes_ok: bool,
    /// File names of the inputs handed to the converter
    pub converted_inputs: Vec<String>,
    /// Compressed input bytes over all stations
    pub compressed_bytes: u64,
    /// Wall time of the run
    pub elapsed: Duration,
}

/// Inputs for one run, grouped the way the monitor counts them
///
/// Built by [`plan_conversion`], which walks the archive with blocking I/O and
/// runs on the blocking pool.
#[derive(Debug, Default)]
struct ConversionPlan {
    jobs: Vec<ConversionJob>,
    progress: BTreeMap<StationId, StationProgress>,
}

fn plan_conversion(
    config: &Config,
    range: &DateRange,
    stations: &[StationId],
) -> Result<ConversionPlan> {
    let layout = LocalLayout::from_config(&config.download);
    let netcdf_root = config.conversion.scratch_root.join("netcdf");
    let mut plan = ConversionPlan::default();

    for station in stations {
        let output_dir = netcdf_root.join(station.as_str());
        std::fs::create_dir_all(&output_dir).map_err(|e| Error::InvalidPath {
            path: output_dir.clone(),
            reason: e.to_string(),
        })?;

        let progress = plan
            .progress
            .entry(station.clone())
            .or_insert_with(|| StationProgress::new(0, 0));

        for day in range.days() {
            for input in list_data_files(&layout.station_dir(day, station)) {
                let in_window = input
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(parse_scan_time)
                    .is_some_and(|t| range.contains(t));
                if !in_window {
                    continue;
                }
                progress.compressed_size_bytes += std::fs::metadata(&input)?.len();
                progress.num_to_convert += 1;
                plan.jobs.push(ConversionJob {
                    input,
                    output_dir: output_dir.clone(),
                });
            }
        }
    }
    Ok(plan)
}

/// Convert every local input of `stations` inside `range` through `launcher`
///
/// Converter failures do not make this return `Err`; they show up as
/// `processes_ok == false` and as pending stations in the report.
pub async fn convert_stations(
    config: &Config,
    launcher: &dyn ConverterLauncher,
    controller: &CancellationController,
    range: &DateRange,
    stations: &[StationId],
    log: &LogHandle,
) -> Result<ConversionSummary> {
    config.validate()?;
    let started = Instant::now();
    let log = log.with_source("conversion");

    let ConversionPlan { jobs, progress } = {
        let config = config.clone();
        let range = *range;
        let stations = stations.to_vec();
        tokio::task::spawn_blocking(move || plan_conversion(&config, &range, &stations))
            .await
            .map_err(|e| Error::Other(format!("conversion planning failed: {e}")))??
    };
    let compressed_bytes: u64 = progress.values().map(|p| p.compressed_size_bytes).sum();
    let files = jobs.len() as u64;
    let converted_inputs: Vec<String> = jobs
        .iter()
        .filter_map(|job| job.input.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .collect();

    log.info(format!(
        "NEXRAD level 2 conversion\n   Start date       : {}\n   End date         : {}\n   Output directory : {}",
        range.start(),
        range.end(),
        config.conversion.scratch_root.join("netcdf").display()
    ));

    if jobs.is_empty() {
        log.info("No files to convert");
        return Ok(ConversionSummary {
            report: MonitorReport {
                done: progress,
                ..MonitorReport::default()
            },
            processes_ok: true,
            converted_inputs,
            compressed_bytes,
            elapsed: started.elapsed(),
        });
    }

    if controller.is_killed() {
        return Err(Error::Cancelled);
    }
    let mut running = launcher.launch(&jobs, &log).await?;

    let table = config.conversion.report_path.as_ref().map(SummaryTable::new);
    let mut monitor = ConversionMonitor::new(
        running.cache_dir(),
        progress,
        config.conversion.poll_interval,
        &log,
    );
    if let Some(table) = &table {
        monitor = monitor.with_summary_table(table.clone());
    }
    let monitor_stop = controller.child_of_kill();
    let mut monitor_task = tokio::spawn(monitor.run(monitor_stop.clone()));

    let exits = running.wait(&controller.kill_token()).await;
    let processes_ok = exits.iter().all(|clean| *clean);

    let joined = match tokio::time::timeout(config.conversion.monitor_grace, &mut monitor_task).await
    {
        Ok(joined) => joined,
        Err(_) => {
            tracing::debug!("Converter cache monitor did not finish within the grace period");
            monitor_stop.cancel();
            monitor_task.await
        }
    };
    running.cleanup().await;
    let report = joined.map_err(|e| Error::Other(format!("conversion monitor failed: {e}")))?;

    if let Some(table) = &table
        && let Err(e) = table.append_totals(compressed_bytes, files, report.total_converted_bytes)
    {
        log.warn(format!(
            "Failed to write totals to {}: {e}",
            table.path().display()
        ));
    }

    let elapsed = started.elapsed();
    log.info(format!(
        "Conversion completed in {:.1} s\n   Input files      : {:10}\n   Input data       : {:10.1} MB\n   Converted data   : {:10.1} MB",
        elapsed.as_secs_f64(),
        files,
        compressed_bytes as f64 / 1.0e6,
        report.total_converted_bytes as f64 / 1.0e6
    ));
    if !processes_ok {
        log.error("Some wct-export commands did not exit cleanly");
    }

    Ok(ConversionSummary {
        report,
        processes_ok,
        converted_inputs,
        compressed_bytes,
        elapsed,
    })
}

/// [`convert_stations`] with `wct-export`, logging through `tracing`
pub async fn convert_with_wct(
    config: &Config,
    controller: &CancellationController,
    range: &DateRange,
    stations: &[StationId],
) -> Result<ConversionSummary> {
    let launcher = WctLauncher::from_config(&config.conversion)?;
    let (log, aggregator) = LogAggregator::spawn(TracingSink);
    let summary = convert_stations(config, &launcher, controller, range, stations, &log).await;
    aggregator.finish().await?;
    summary
}
