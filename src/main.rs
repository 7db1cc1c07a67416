use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;

use ski_cluster::config::{Args, Config, InPaths, OutPaths};
use ski_cluster::geocoder::NullGeocoder;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level)).init();
    dotenv::dotenv().ok();

    let config = Config::from_args(&args).expect("invalid configuration");
    let in_paths = InPaths::from_dir(&args.input_dir);
    let out_paths = OutPaths::from_dir(&args.output_dir);

    info!("input directory: {:?}", args.input_dir);
    info!("output directory: {:?}", args.output_dir);
    info!(
        "database pool: max={}, min={}",
        config.max_connections, config.min_connections
    );

    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner} {msg}").unwrap());
    pb.set_message("clustering ski areas");
    pb.enable_steady_tick(std::time::Duration::from_millis(120));

    let null_geocoder = NullGeocoder;
    let geocoder = if config.geocode { Some(&null_geocoder as &dyn ski_cluster::geocoder::Geocoder) } else { None };

    match ski_cluster::cluster_ski_areas(&in_paths, &out_paths, &config, geocoder).await {
        Ok(summary) => {
            pb.finish_with_message("done");
            info!(
                "loaded {} ski area(s), {} lift(s), {} run(s); exported {} ski area(s), {} lift(s), {} run(s)",
                summary.load.ski_areas_loaded,
                summary.load.lifts_loaded,
                summary.load.runs_loaded,
                summary.export.ski_areas,
                summary.export.lifts,
                summary.export.runs,
            );
        }
        Err(e) => {
            pb.finish_with_message("failed");
            eprintln!("clustering failed: {e}");
            std::process::exit(1);
        }
    }
}
