use std::fmt::Write;

use pipebench_runtime::BenchReport;

/// Three decimals, switching to scientific notation for small non-zero values.
pub fn format_float(value: f64) -> String {
    if value != 0.0 && value.abs() < 0.1 {
        format!("{value:.3e}")
    } else {
        format!("{value:.3}")
    }
}

pub fn summary_table(report: &BenchReport) -> String {
    let devices = report
        .devices
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",");

    let rows = [
        ("shapes", report.shape_info.clone()),
        ("batch", report.batch.to_string()),
        ("devices", devices),
        ("iterations", report.iterations.to_string()),
        ("copy elision", report.copy_elision.to_string()),
        ("avg latency (ms)", format_float(report.avg_latency_ms)),
        ("avg latency (us)", format_float(report.avg_latency_us())),
        ("throughput (items/s)", format_float(report.throughput)),
        ("wall clock (ms)", format_float(report.wall_clock_ms)),
    ];

    let width = rows.iter().map(|(label, _)| label.len()).max().unwrap_or(0);
    let mut out = String::new();
    for (label, value) in rows {
        let _ = writeln!(out, "{label:<width$}  {value}");
    }
    out
}
