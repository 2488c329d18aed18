//! Developer CLI: parse a local document against rule data and dump the
//! tree, without needing a live server.

use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use xylem::{grammars, Backend, Config, Grammar, Handler, Result, Template};

#[derive(Debug, Parser)]
#[command(name = "xylem", version, about = "Streaming XML into object trees.")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Parse an XML file against a template and print the result tree.
    Parse {
        /// The XML document to parse.
        file: PathBuf,
        /// Built-in grammar name or path to a rule-data YAML file.
        /// Defaults to the generic tree template.
        #[arg(long)]
        template: Option<String>,
        /// Event-source backend to use.
        #[arg(long)]
        backend: Option<String>,
        /// Emit YAML instead of JSON.
        #[arg(long)]
        yaml: bool,
    },
    /// Show the grammars and backends this build knows.
    Info,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    match run(Args::parse()) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<ExitCode> {
    match args.command {
        Command::Parse { file, template, backend, yaml } => {
            let template = resolve_template(template.as_deref())?;
            let backend = Backend::probe(backend.as_deref())?;
            let mut input = File::open(&file)?;
            let document = Handler::new(&template, Config::default()).run(&mut input, backend);

            for entry in &document.errors {
                eprintln!("warning: {entry}");
            }
            if yaml {
                let text = serde_yaml::to_string(&document.root)
                    .map_err(|e| xylem::XylemError::config(format!("cannot render yaml: {e}")))?;
                print!("{text}");
            } else {
                let text = serde_json::to_string_pretty(&document.root)
                    .map_err(|e| xylem::XylemError::config(format!("cannot render json: {e}")))?;
                println!("{text}");
            }
            Ok(if document.is_clean() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Command::Info => {
            println!("grammars:");
            for grammar in [Grammar::FmResultset, Grammar::FmpXmlResult, Grammar::FmpXmlLayout] {
                println!("  {grammar}");
            }
            println!("backends:");
            println!("  quick-xml (fallback)");
            #[cfg(feature = "xml-rs")]
            println!("  xml-rs");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn resolve_template(spec: Option<&str>) -> Result<std::sync::Arc<Template>> {
    match spec {
        None => Ok(std::sync::Arc::new(Template::generic())),
        Some(name) => match Grammar::parse(name) {
            Some(grammar) => Ok(grammars::template_for(grammar)),
            None => {
                let rules = std::fs::read_to_string(name)?;
                let template = Template::from_yaml(&rules, &grammars::builtin_bindings())?;
                Ok(std::sync::Arc::new(template))
            }
        },
    }
}
