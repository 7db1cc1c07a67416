//! Clusters ski lifts and runs into ski areas from GeoJSON input,
//! cross-linking and merging across sources. See [`cluster_ski_areas`] for
//! the single public entry point; everything else is organized by pipeline
//! stage (Loader → Object Store → Clustering Pipeline → Augmenter →
//! Exporter).

pub mod augmenter;
pub mod config;
pub mod error;
pub mod exporter;
pub mod geocoder;
pub mod geometry;
pub mod loader;
pub mod merger;
pub mod model;
pub mod pipeline;
pub mod retry;
pub mod store;
pub mod traversal;

use std::sync::Arc;

use log::info;

use config::{Config, InPaths, OutPaths};
use error::ClusterError;
use geocoder::{Geocoder, NullGeocoder};
use store::postgres::PostgresStore;
use store::ObjectStore;

#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    pub load: loader::LoadSummary,
    pub pipeline: pipeline::PipelineSummary,
    pub augment: augmenter::AugmentSummary,
    pub export: exporter::ExportSummary,
}

fn read_features(path: &std::path::Path) -> Result<Vec<geojson::Feature>, ClusterError> {
    let text = std::fs::read_to_string(path).map_err(|e| ClusterError::Loader {
        feature: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let geojson: geojson::GeoJson = text.parse().map_err(|e: geojson::Error| ClusterError::Loader {
        feature: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let collection = geojson::FeatureCollection::try_from(geojson).map_err(|e| ClusterError::Loader {
        feature: path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(collection.features)
}

fn write_features(path: &std::path::Path, collection: geojson::FeatureCollection) -> Result<(), ClusterError> {
    let json = serde_json::to_string(&collection).map_err(|e| ClusterError::Loader {
        feature: path.display().to_string(),
        reason: e.to_string(),
    })?;
    std::fs::write(path, json).map_err(|e| ClusterError::Loader {
        feature: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Runs the full load → cluster → augment → export sequence against a fresh
/// PostGIS-backed store. `geocoder` is optional per §6; pass `None` to use
/// [`NullGeocoder`], matching the CLI's default when `--geocode` is absent.
pub async fn cluster_ski_areas(
    in_paths: &InPaths,
    out_paths: &OutPaths,
    config: &Config,
    geocoder: Option<&dyn Geocoder>,
) -> Result<RunSummary, ClusterError> {
    let store = PostgresStore::connect(&config.database_url, config.max_connections, config.min_connections)
        .await?;
    store.run_migrations().await?;
    let store: Arc<dyn ObjectStore> = Arc::new(store);

    info!("reading input features from disk");
    let ski_area_features = read_features(&in_paths.ski_areas)?;
    let lift_features = read_features(&in_paths.lifts)?;
    let run_features = read_features(&in_paths.runs)?;

    let load = loader::load_all(store.as_ref(), ski_area_features, lift_features, run_features).await?;
    info!(
        "loaded {} ski area(s), {} lift(s), {} run(s), skipped {}",
        load.ski_areas_loaded, load.lifts_loaded, load.runs_loaded, load.skipped
    );

    let pipeline_config = pipeline::PipelineConfig {
        parallel_ski_areas: config.parallel_ski_areas,
        ..Default::default()
    };
    let pipeline_summary = pipeline::run(Arc::clone(&store), &pipeline_config).await?;

    let null_geocoder = NullGeocoder;
    let geocoder = geocoder.unwrap_or(&null_geocoder);
    let augment = augmenter::run(store.as_ref(), if config.geocode { Some(geocoder) } else { None }).await?;

    let (exported, export) = exporter::export(store.as_ref()).await?;

    std::fs::create_dir_all(out_paths.ski_areas.parent().unwrap_or(std::path::Path::new(".")))
        .map_err(|e| ClusterError::Loader { feature: "output directory".to_string(), reason: e.to_string() })?;
    write_features(&out_paths.ski_areas, exported.ski_areas)?;
    write_features(&out_paths.lifts, exported.lifts)?;
    write_features(&out_paths.runs, exported.runs)?;

    Ok(RunSummary { load, pipeline: pipeline_summary, augment, export })
}
