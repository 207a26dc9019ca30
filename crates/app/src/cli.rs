use anyhow::Result;

use app::pipeline::{self, PipelineConfig};

/// Dispatch the subcommand in `args`; returns `Ok(false)` when no
/// subcommand matched so the caller can print usage.
pub fn handle_commands(args: &[String]) -> Result<bool> {
    match args.get(1).map(|s| s.as_str()) {
        Some("process") => {
            let config = PipelineConfig::from_args(args)?;
            let report = pipeline::run(config)?;
            println!(
                "Committed {} frame(s), {} particle(s), cursor {}",
                report.frames_committed,
                report.particles,
                report
                    .final_cursor
                    .map_or_else(|| "none".to_string(), |c| c.to_string()),
            );
            Ok(true)
        }
        Some("verify") => {
            let Some(prefix) = args.get(2) else {
                anyhow::bail!("Usage: particle-pipeline verify <output-prefix>");
            };
            let report = pipeline::verify(std::path::Path::new(prefix))?;
            println!(
                "cursor {}: {} committed record(s), aggregate {}",
                report
                    .cursor
                    .map_or_else(|| "none".to_string(), |c| c.to_string()),
                report.committed_records,
                if report.matches {
                    "matches replay"
                } else {
                    "DIVERGES from replay"
                },
            );
            if !report.matches {
                anyhow::bail!("aggregate snapshot does not match record replay");
            }
            Ok(true)
        }
        Some("help") | Some("--help") | Some("-h") => {
            print_usage();
            Ok(true)
        }
        _ => Ok(false),
    }
}

pub fn print_usage() {
    println!("particle-pipeline: frame-to-statistics particle imaging pipeline");
    println!();
    println!("{}", app::pipeline::config::PROCESS_USAGE);
    println!("       particle-pipeline verify <output-prefix>");
}
