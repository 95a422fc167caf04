use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;

use pmkrig::{
    AreaRegistry, CancellationToken, Estimator, EstimatorConfig, MemoryStore, QueryLocation,
    TimeRange,
};

/// Parse `lat,lon` or `lat,lon,elevation`
fn parse_location(value: &str) -> std::result::Result<QueryLocation, String> {
    let fields = value
        .split(',')
        .map(|f| f.trim().parse::<f64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid location {value}: {e}"))?;
    match fields[..] {
        [lat, lon] => Ok(QueryLocation::new(lat, lon)),
        [lat, lon, elevation] => Ok(QueryLocation::new(lat, lon).with_elevation(elevation)),
        _ => Err(format!("location should be lat,lon[,elevation], got {value}")),
    }
}

/// PM2.5 estimates at given locations from a file of sensor readings
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// JSON file describing the areas
    #[arg(long)]
    areas: PathBuf,
    /// Area id, by default the area containing the first location
    #[arg(long)]
    area: Option<String>,
    /// JSON file holding an array of sensor readings
    #[arg(long)]
    readings: PathBuf,
    /// First query time, naive times are taken in the area timezone
    #[arg(long)]
    start: String,
    /// Last query time, naive times are taken in the area timezone
    #[arg(long)]
    end: String,
    /// Hours between two query times
    #[arg(long, default_value_t = 1.)]
    interval_hours: f64,
    /// Query location as lat,lon[,elevation], repeatable
    #[arg(short, long = "location", value_parser = parse_location, required = true)]
    locations: Vec<QueryLocation>,
    /// JSON file of estimation settings
    #[arg(long)]
    config: Option<PathBuf>,
    /// Give up chunks not started after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Estimate averages over windows of this many hours
    #[arg(long)]
    aggregation_hours: Option<f64>,
    /// Output the covariance between locations at each query time
    #[arg(long)]
    full_covariance: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let registry = AreaRegistry::from_file(&args.areas)
        .with_context(|| format!("loading areas from {}", args.areas.display()))?;
    let first = args.locations[0];
    let area = match &args.area {
        Some(id) => registry.by_id(id),
        None => registry.by_location(first.latitude, first.longitude),
    }
    .ok_or_else(|| anyhow!("no area found for the query"))?;

    let config = match &args.config {
        Some(path) => EstimatorConfig::from_json_file(path)?,
        None => EstimatorConfig::default(),
    };
    let config = match args.aggregation_hours {
        Some(hours) => config.aggregation_hours(Some(hours)),
        None => config,
    };
    let config = if args.full_covariance {
        config.full_covariance(true)
    } else {
        config
    };
    let store = MemoryStore::from_json_file(&args.readings)
        .with_context(|| format!("loading readings from {}", args.readings.display()))?;
    let estimator = Estimator::new(config, store)?;

    let range = TimeRange::new(area.parse_time(&args.start)?, area.parse_time(&args.end)?);
    let times = range.sample(args.interval_hours)?;
    let cancel = match args.timeout_secs {
        Some(secs) => CancellationToken::with_timeout(Duration::from_secs(secs)),
        None => CancellationToken::new(),
    };
    let estimates = estimator.compute_estimates(area, &times, &args.locations, &cancel)?;

    let mut output = json!({
        "area": area.id(),
        "note": area.note_text(),
        "times": times.iter().map(|t| t.to_rfc3339()).collect::<Vec<_>>(),
        "locations": args.locations,
        "elevations": estimates.elevations.to_vec(),
        "predictions": estimates.predictions.rows().into_iter().map(|r| r.to_vec()).collect::<Vec<_>>(),
        "variances": estimates.variances.rows().into_iter().map(|r| r.to_vec()).collect::<Vec<_>>(),
        "status": estimates.status_messages(),
    });
    if let Some(cov) = &estimates.covariances {
        output["covariances"] = json!(cov
            .outer_iter()
            .map(|block| block.rows().into_iter().map(|r| r.to_vec()).collect::<Vec<_>>())
            .collect::<Vec<_>>());
    }
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
