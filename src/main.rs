mod cli;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;

use cf_av::{FfprobeProber, ToolRegistry};
use cf_core::config::Config;
use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins; otherwise the verbose flag picks the default.
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "clipforge=trace,cf_server=debug,cf_jobs=debug,cf_av=debug,cf_core=debug,tower_http=debug"
                .to_string()
        } else {
            "clipforge=info,cf_server=info,cf_jobs=info,cf_av=info,cf_core=info,tower_http=info"
                .to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    match cli.command {
        Commands::Start { host, port } => {
            let mut config = Config::load_or_default(cli.config.as_deref());
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cf_server::start(config))?;
            Ok(())
        }
        Commands::Probe { file, json } => {
            let config = Config::load_or_default(cli.config.as_deref());
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(probe_file(&config, &file, json))
        }
        Commands::CheckTools => {
            let config = Config::load_or_default(cli.config.as_deref());
            check_tools(&config)
        }
        Commands::Validate { file } => {
            let path = file.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("clipforge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn probe_file(config: &Config, file: &Path, json: bool) -> Result<()> {
    if !file.exists() {
        anyhow::bail!("File does not exist: {}", file.display());
    }

    let tools = ToolRegistry::discover(&config.tools);
    let ffprobe = tools.require(cf_av::tools::FFPROBE)?;
    let meta = FfprobeProber::new(ffprobe.to_path_buf())
        .probe(file, None)
        .await
        .with_context(|| format!("probing {}", file.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&meta)?);
        return Ok(());
    }

    println!("File: {}", file.display());
    if let Some(format) = &meta.format_name {
        println!("Container: {format}");
    }
    if let Some(size) = meta.size {
        println!("Size: {size} bytes");
    }
    if let Some(duration) = meta.duration {
        let secs = duration as u64;
        println!(
            "Duration: {:02}:{:02}:{:02} ({duration:.3}s)",
            secs / 3600,
            (secs / 60) % 60,
            secs % 60
        );
    }
    if let Some(bitrate) = meta.bitrate {
        println!("Bitrate: {} kb/s", bitrate / 1000);
    }
    println!("Streams: {}", meta.stream_count);

    if let Some(video) = &meta.video {
        print!("Video: {}", video.codec.as_deref().unwrap_or("unknown"));
        if let (Some(w), Some(h)) = (video.width, video.height) {
            print!(" {w}x{h}");
        }
        if let Some(fps) = video.frame_rate() {
            print!(" {fps:.3} fps");
        }
        println!();
    }
    if let Some(audio) = &meta.audio {
        print!("Audio: {}", audio.codec.as_deref().unwrap_or("unknown"));
        if let Some(rate) = audio.sample_rate {
            print!(" {rate} Hz");
        }
        if let Some(channels) = audio.channels {
            print!(" {channels}ch");
        }
        println!();
    }

    Ok(())
}

fn check_tools(config: &Config) -> Result<()> {
    println!("Checking external tools...\n");

    let tools = ToolRegistry::discover(&config.tools);
    let mut all_ok = true;

    for tool in tools.check_all() {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{status} {}", tool.name);
        if let Some(version) = &tool.version {
            print!(" ({version})");
        }
        if let Some(path) = &tool.path {
            print!(" - {}", path.display());
        }
        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
        Ok(())
    } else {
        anyhow::bail!("ffmpeg and ffprobe are required; install them or set [tools] paths")
    }
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {}", p.display());
            let contents = std::fs::read_to_string(p)
                .with_context(|| format!("reading {}", p.display()))?;
            Config::from_toml(&contents)?
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    config.check()?;
    for warning in config.validate() {
        println!("  warning: {warning}");
    }

    println!("✓ Configuration is valid");
    println!("  Server: {}:{}", config.server.host, config.server.port);
    println!(
        "  Workers: {} (queue ceiling {})",
        config.orchestrator.workers, config.orchestrator.queue_ceiling
    );
    println!("  Job timeout: {}s", config.orchestrator.job_timeout_secs);
    println!(
        "  Storage: uploads {} / output {}",
        config.storage.upload_dir.display(),
        config.storage.output_dir.display()
    );
    println!(
        "  Artifact retention: {}s",
        config.storage.artifact_retention_secs
    );
    Ok(())
}
