//! Templar CLI - batch and inspection front end
//!
//! Commands: check, render, precompile, analyze
//! Outputs JSON to stdout (render prints the rendered text)
//! Returns 2 on an insecure template or a partially failed batch

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use templar_core::{
    precompile::BatchResult, ArtifactFormat, CancellationFlag, EngineConfig, PrecompileOptions, RenderMode,
    TemplateContext, TemplateEngine,
};

#[derive(Parser)]
#[command(name = "templar-cli")]
#[command(about = "Templar CLI - Template Compiler and Sandboxed Renderer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine config (JSON); a missing file means defaults
    #[arg(short, long, default_value = "templar.json")]
    config: PathBuf,

    /// Extra directory searched for layouts and partials
    #[arg(short, long)]
    templates_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Security report for a template
    Check { file: PathBuf },

    /// Render a template
    Render {
        file: PathBuf,

        /// JSON object of root variables
        #[arg(long, default_value = "{}")]
        vars: String,

        /// Substitute error markers instead of failing
        #[arg(long)]
        lenient: bool,
    },

    /// Precompile every matching template under a directory
    Precompile {
        dir: PathBuf,

        #[arg(long, default_value = "**/*.tpl")]
        pattern: String,

        /// source, binary, bytecode or assembly
        #[arg(long, default_value = "bytecode")]
        format: ArtifactFormat,

        /// Where to write artifacts; only the summary is printed when absent
        #[arg(long)]
        out: Option<PathBuf>,

        #[arg(long)]
        source_map: bool,
    },

    /// Performance report for a template
    Analyze { file: PathBuf },
}

fn print_json(value: &impl Serialize) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => println!("{}", serde_json::json!({ "error": e.to_string() })),
    }
}

fn fail(message: impl std::fmt::Display) -> ExitCode {
    print_json(&serde_json::json!({ "success": false, "error": message.to_string() }));
    ExitCode::FAILURE
}

fn template_name(file: &Path) -> String {
    file.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "template".to_string())
}

async fn write_artifacts(out: &Path, result: &BatchResult) -> std::io::Result<()> {
    for (name, artifact) in &result.succeeded {
        let path = out.join(format!("{}.{}", name, artifact.format.extension()));
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = match artifact.format {
            ArtifactFormat::Source => artifact.text().map_err(std::io::Error::other)?,
            _ => artifact.to_json().map_err(std::io::Error::other)?,
        };
        tokio::fs::write(&path, body).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match EngineConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => return fail(format!("Failed to load config: {}", e)),
    };
    if let Some(dir) = &cli.templates_dir {
        config.partial_dirs.push(dir.clone());
        config.layout_dirs.push(dir.clone());
    }

    match cli.command {
        Commands::Check { file } => {
            let source = match tokio::fs::read_to_string(&file).await {
                Ok(s) => s,
                Err(e) => return fail(e),
            };
            let engine = TemplateEngine::new(config);
            match engine.check_security(&source) {
                Ok(result) => {
                    print_json(&result);
                    if result.is_secure {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::from(2)
                    }
                }
                Err(e) => fail(e),
            }
        }

        Commands::Render { file, vars, lenient } => {
            let source = match tokio::fs::read_to_string(&file).await {
                Ok(s) => s,
                Err(e) => return fail(e),
            };
            let vars: serde_json::Value = match serde_json::from_str(&vars) {
                Ok(v) => v,
                Err(e) => return fail(format!("Invalid vars: {}", e)),
            };
            if lenient {
                config.render.mode = RenderMode::Lenient;
            }
            let engine = TemplateEngine::new(config);
            let mut ctx = TemplateContext::from_json(vars);
            match engine.render(&template_name(&file), &source, &mut ctx).await {
                Ok(output) => {
                    print!("{}", output.text);
                    if !output.errors.is_empty() {
                        match serde_json::to_string(&output.errors) {
                            Ok(errors) => eprintln!("{}", errors),
                            Err(e) => eprintln!("{}", e),
                        }
                    }
                    ExitCode::SUCCESS
                }
                Err(e) => fail(e),
            }
        }

        Commands::Precompile {
            dir,
            pattern,
            format,
            out,
            source_map,
        } => {
            config.partial_dirs.push(dir.clone());
            config.layout_dirs.push(dir.clone());
            if source_map {
                config.compiler.debug_info = true;
            }
            let engine = TemplateEngine::new(config);
            let options = PrecompileOptions {
                format,
                source_map,
                debug_info: source_map,
            };
            let result = match engine
                .precompile_directory(&dir, &pattern, &options, &CancellationFlag::new())
                .await
            {
                Ok(r) => r,
                Err(e) => return fail(e),
            };
            if let Some(out) = out {
                if let Err(e) = write_artifacts(&out, &result).await {
                    return fail(format!("Failed to write artifacts: {}", e));
                }
            }
            print_json(&result.summary());
            if result.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            }
        }

        Commands::Analyze { file } => {
            let source = match tokio::fs::read_to_string(&file).await {
                Ok(s) => s,
                Err(e) => return fail(e),
            };
            match TemplateEngine::new(config).analyze_performance(&source) {
                Ok(report) => {
                    print_json(&report);
                    ExitCode::SUCCESS
                }
                Err(e) => fail(e),
            }
        }
    }
}
