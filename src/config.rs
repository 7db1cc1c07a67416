use std::env;
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(about = "Clusters ski lifts and runs into ski areas from GeoJSON input")]
pub struct Args {
    /// Directory containing ski_areas.geojson, lifts.geojson, runs.geojson
    #[arg(long)]
    pub input_dir: PathBuf,

    /// Directory the clustered FeatureCollections are written to
    #[arg(long)]
    pub output_dir: PathBuf,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Postgres connection string; falls back to DATABASE_URL
    #[arg(long)]
    pub database_url: Option<String>,

    /// Maximum number of database connections in the pool
    #[arg(long, default_value_t = 20)]
    pub max_connections: u32,

    /// Minimum number of database connections to keep warm
    #[arg(long, default_value_t = 5)]
    pub min_connections: u32,

    /// Number of ski areas to process concurrently within a phase
    #[arg(long, default_value_t = 10)]
    pub parallel_ski_areas: usize,

    /// Enable reverse geocoding of each ski area's centroid
    #[arg(long, default_value_t = false)]
    pub geocode: bool,

    /// Optional snow-cover archive root used to annotate runs by pixel id
    #[arg(long)]
    pub snow_cover_archive: Option<PathBuf>,
}

/// Resolved, validated configuration handed to [`crate::cluster_ski_areas`].
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub parallel_ski_areas: usize,
    pub geocode: bool,
    pub snow_cover_archive: Option<PathBuf>,
}

impl Config {
    pub fn from_args(args: &Args) -> anyhow::Result<Self> {
        let database_url = args
            .database_url
            .clone()
            .or_else(|| env::var("DATABASE_URL").ok())
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set (flag or env var)"))?;

        Ok(Config {
            database_url,
            max_connections: args.max_connections,
            min_connections: args.min_connections,
            parallel_ski_areas: args.parallel_ski_areas,
            geocode: args.geocode,
            snow_cover_archive: args.snow_cover_archive.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct InPaths {
    pub ski_areas: PathBuf,
    pub lifts: PathBuf,
    pub runs: PathBuf,
}

impl InPaths {
    pub fn from_dir(dir: &std::path::Path) -> Self {
        InPaths {
            ski_areas: dir.join("ski_areas.geojson"),
            lifts: dir.join("lifts.geojson"),
            runs: dir.join("runs.geojson"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutPaths {
    pub ski_areas: PathBuf,
    pub lifts: PathBuf,
    pub runs: PathBuf,
}

impl OutPaths {
    pub fn from_dir(dir: &std::path::Path) -> Self {
        OutPaths {
            ski_areas: dir.join("ski_areas.geojson"),
            lifts: dir.join("lifts.geojson"),
            runs: dir.join("runs.geojson"),
        }
    }
}
