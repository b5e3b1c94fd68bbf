use std::env;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use env_logger::Builder;
use log::{error, info, warn};

use xenotx_pipelines::cli::parse;
use xenotx_pipelines::config::defs::{RunConfig, PREFLIGHT_TOOLS};
use xenotx_pipelines::graph::ProcessRunner;
use xenotx_pipelines::pipelines::xenograft;
use xenotx_pipelines::utils::command::check_versions;
use xenotx_pipelines::utils::system::clamp_resources;

#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let dir = env::current_dir()?;
    let mut config = match RunConfig::from_args(args.clone(), &dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    Builder::new()
        .filter_level(config.log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    println!("\n-------------\n XenoTx\n-------------\n");
    info!("The current directory is {:?}", dir);
    info!("Run name: {}", config.run_name);
    info!("Strandedness: {}; single-end: {}", config.strandedness, config.single_end);
    info!("Xeno contigs: {}", config.reference.xeno.join(", "));

    config.resources = clamp_resources(config.resources).await;
    info!(
        "Resources: {} CPUs, {} GiB, {:?} per task; {} CPUs per task",
        config.resources.max_cpus,
        config.resources.max_memory / 1_073_741_824,
        config.resources.max_time,
        config.task_cpus()
    );

    let versions = if args.skip_tool_check {
        warn!("Skipping tool preflight checks");
        Vec::new()
    } else {
        match check_versions(PREFLIGHT_TOOLS, &config.profile, &dir).await {
            Ok(versions) => versions,
            Err(e) => {
                error!("Tool preflight failed: {}", e);
                std::process::exit(1);
            }
        }
    };

    let runner = Arc::new(ProcessRunner::new(config.profile.clone(), &dir));
    let config = Arc::new(config);

    match xenograft::run(config, runner, versions).await {
        Ok(summary) if summary.is_success() => {
            println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
            Ok(())
        }
        Ok(summary) => {
            error!(
                "No sample completed ({} failed) at {} milliseconds.",
                summary.failed.len(),
                run_start.elapsed().as_millis()
            );
            std::process::exit(1);
        }
        Err(e) => {
            error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
            std::process::exit(1);
        }
    }
}
