//! Node Coherence CLI
//!
//! Computes node-to-node coherence of a time series into a Zarr container.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use node_coherence::{
    analyze, run_analysis, CancelFlag, CoherenceResultReader, Config, SyntheticSeries,
};

#[derive(Parser)]
#[command(name = "node-coherence")]
#[command(about = "Compute node-to-node coherence of a time series into Zarr", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override data points per FFT block
    #[arg(long, global = true)]
    nfft: Option<usize>,

    /// Override the result container path
    #[arg(long, global = true)]
    output: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coherence analysis (default if no command specified)
    Run,

    /// Print estimates and the admission decision without computing
    Analyze,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short = 'p', long, default_value = "config.yaml")]
        path: PathBuf,
    },

    /// Print the shape and metadata of a sealed result
    Inspect {
        /// Path to the result container
        path: PathBuf,
    },

    /// Write a deterministic synthetic input series
    Synthesize {
        /// Path of the series container to create
        path: PathBuf,

        /// Shape as time,variable,node,mode
        #[arg(long, value_delimiter = ',', default_values_t = [4096, 2, 8, 1])]
        shape: Vec<usize>,

        /// Sampling period in milliseconds
        #[arg(long, default_value_t = 1.0)]
        sample_period_ms: f64,

        /// Tone frequency in Hz
        #[arg(long, default_value_t = 40.0)]
        tone_hz: f64,

        /// Identifier stamped on the series
        #[arg(long, default_value = "synthetic")]
        gid: String,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Run) => {
            run_command(cli.config, cli.nfft, cli.output)?;
        }

        Some(Commands::Analyze) => {
            analyze_command(cli.config, cli.nfft, cli.output)?;
        }

        Some(Commands::Validate) => {
            validate_command(cli.config)?;
        }

        Some(Commands::GenerateConfig { path }) => {
            generate_config_command(path)?;
        }

        Some(Commands::Inspect { path }) => {
            inspect_command(path)?;
        }

        Some(Commands::Synthesize {
            path,
            shape,
            sample_period_ms,
            tone_hz,
            gid,
        }) => {
            if shape.len() != 4 {
                anyhow::bail!("--shape takes four values (time,variable,node,mode), got {}", shape.len());
            }
            let synthetic = SyntheticSeries {
                shape: [shape[0], shape[1], shape[2], shape[3]],
                sample_period_ms,
                tone_hz,
                ..Default::default()
            };
            synthetic.write(&path, gid)?;
            println!("Wrote synthetic series to: {}", path.display());
        }
    }

    Ok(())
}

fn load_config(config_path: &PathBuf, nfft: Option<usize>, output: Option<String>) -> Result<Config> {
    let mut config = Config::from_file(config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;

    // Apply overrides
    if let Some(n) = nfft {
        config.analysis.nfft = n;
    }
    if let Some(path) = output {
        config.output.path = path;
    }

    config.validate()?;
    Ok(config)
}

fn run_command(config_path: PathBuf, nfft: Option<usize>, output: Option<String>) -> Result<()> {
    let config = load_config(&config_path, nfft, output)?;

    let report = run_analysis(&config, CancelFlag::new())?;

    if config.processing.enable_metrics {
        report.metrics.print_summary();
    }
    println!("{}", report);
    Ok(())
}

fn analyze_command(config_path: PathBuf, nfft: Option<usize>, output: Option<String>) -> Result<()> {
    let config = load_config(&config_path, nfft, output)?;
    let analysis = analyze(&config)?;

    println!("\n=== Coherence Analysis ===");
    println!("{}", analysis);
    println!("==========================\n");
    Ok(())
}

fn validate_command(config_path: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

fn inspect_command(path: PathBuf) -> Result<()> {
    let result = CoherenceResultReader::open(&path)?;
    let metadata = result.metadata();
    let frequency = result.frequency()?;

    println!("\n=== Coherence Result ===");
    println!("Path: {}", path.display());
    println!("Shape (freq, node, node, variable, mode): {:?}", result.shape());
    println!("gid: {}", metadata.gid);
    println!("Source gid: {}", metadata.source_gid);
    println!(
        "Sample period: {} {}",
        metadata.sample_period, metadata.sample_period_unit
    );
    println!("nfft: {}", metadata.nfft);
    if let (Some(first), Some(last)) = (frequency.first(), frequency.last()) {
        println!("Frequency: {} bins, {:.3} to {:.3} Hz", frequency.len(), first, last);
    }
    println!("========================\n");
    Ok(())
}

fn generate_config_command(path: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# Node Coherence Configuration

# === INPUT: Time series to analyze ===
input:
  # Zarr v3 group holding a float64 `data` array (time, variable, node, mode)
  # and attributes gid, sample_period, sample_period_unit
  path: "series.zarr"

# === OUTPUT: Where to write the coherence result ===
output:
  # Local filesystem path for the result container
  path: "coherence.zarr"

  # Zstd compression level (0-22, higher = smaller but slower)
  compression_level: 3

  # Replace an existing container at path
  overwrite: false

# === ANALYSIS ===
analysis:
  # Data points per FFT block (a power of two is expected)
  nfft: 256

# === LIMITS: Admission checks before any I/O (optional) ===
# limits:
#   max_memory_bytes: 1073741824
#   max_disk_kilobytes: 10485760

# === PROCESSING ===
processing:
  # Print a metrics summary after the run
  enable_metrics: true

  # Optional path to save metrics JSON after run completes
  # metrics_output_path: "metrics.json"
"#;

    std::fs::write(&path, yaml)?;
    println!("Generated sample configuration at: {}", path.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_default() {
        // No subcommand - should default to Run
        let cli = Cli::try_parse_from(["node-coherence"]);
        assert!(cli.is_ok());
        assert!(cli.unwrap().command.is_none());
    }

    #[test]
    fn test_cli_parse_overrides() {
        let cli = Cli::try_parse_from(["node-coherence", "run", "--nfft", "512", "--output", "out.zarr"])
            .unwrap();
        assert_eq!(cli.nfft, Some(512));
        assert_eq!(cli.output.as_deref(), Some("out.zarr"));
    }

    #[test]
    fn test_cli_parse_validate() {
        let cli = Cli::try_parse_from(["node-coherence", "validate", "-c", "test.json"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_cli_parse_synthesize_shape() {
        let cli = Cli::try_parse_from(["node-coherence", "synthesize", "s.zarr", "--shape", "128,3,4,2"])
            .unwrap();
        match cli.command {
            Some(Commands::Synthesize { shape, .. }) => assert_eq!(shape, vec![128, 3, 4, 2]),
            _ => panic!("expected synthesize"),
        }
    }

    #[test]
    fn test_generated_config_parses() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        generate_config_command(path.clone()).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.analysis.nfft, 256);
        assert!(config.validate().is_ok());
    }
}
