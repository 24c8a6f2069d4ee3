use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tokio::runtime::Runtime;
use tracing_subscriber::{EnvFilter, fmt};
use weft_core::{Access, HostValue, Side, TypeHint};
use weft_node::io::{host_value_from_json, host_value_to_json};
use weft_node::{ComponentDocument, HostContext, ScriptComponent, SolveData, SolveReport, Status};
use weft_pipeline::{Language, WeftConfig, toolchain};
use weft_runtime::{RuntimeEnvironment, RuntimeOptions};

const BUILD_TIMEOUT: Duration = Duration::from_secs(180);
const WATCH_POLL: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(name = "weft", version, about = "Build, watch and run weft script components")]
struct Cli {
    /// Config file [default: ~/.weft/weft.toml]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a component from the template, build it and save it
    New {
        /// Component document to write
        document: PathBuf,
        #[arg(long)]
        typescript: bool,
    },
    /// Rebuild a saved component from its source
    Build { document: PathBuf },
    /// Solve a saved component once and print its outputs
    Run {
        document: PathBuf,
        /// Input value as NAME=VALUE; VALUE is JSON, or text when it does not parse
        #[arg(short, long = "input", value_name = "NAME=VALUE")]
        inputs: Vec<String>,
        /// Wait for an inspector client on this port before running
        #[arg(long, value_name = "PORT")]
        debug: Option<u16>,
    },
    /// Unpack the source, then rebuild, save and solve again on every change
    Watch {
        document: PathBuf,
        #[arg(short, long = "input", value_name = "NAME=VALUE")]
        inputs: Vec<String>,
        /// Open the source in Visual Studio Code
        #[arg(long)]
        open: bool,
    },
    /// Show or edit a component's parameters
    Slots {
        document: PathBuf,
        #[command(subcommand)]
        edit: Option<SlotEdit>,
    },
    /// Check for node, npx and the editor
    Doctor,
}

#[derive(Subcommand)]
enum SlotEdit {
    /// Append a slot with an invented name
    Add { side: SideArg },
    Remove { side: SideArg, index: usize },
    Rename { side: SideArg, index: usize, name: String },
    Access { side: SideArg, index: usize, access: AccessArg },
    Optional {
        side: SideArg,
        index: usize,
        #[arg(action = ArgAction::Set)]
        optional: bool,
    },
    /// any, number, string, boolean, date, or a host type name
    Hint { side: SideArg, index: usize, hint: String },
    /// Enable or disable the console output channel
    Channel {
        #[arg(action = ArgAction::Set)]
        enabled: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SideArg {
    Input,
    Output,
}

impl From<SideArg> for Side {
    fn from(side: SideArg) -> Self {
        match side {
            SideArg::Input => Side::Input,
            SideArg::Output => Side::Output,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum AccessArg {
    Item,
    List,
    Tree,
}

impl From<AccessArg> for Access {
    fn from(access: AccessArg) -> Self {
        match access {
            AccessArg::Item => Access::Item,
            AccessArg::List => Access::List,
            AccessArg::Tree => Access::Tree,
        }
    }
}

fn main() -> Result<()> {
    // Logs go to stderr; stdout carries command output only.
    fmt()
        .with_env_filter(EnvFilter::from_env("WEFT_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let runtime = Runtime::new().context("failed to start the async runtime")?;

    let config = WeftConfig::load_or_default(cli.config.as_deref())?;
    let env = RuntimeEnvironment::new(RuntimeOptions {
        memory_limit: config.runtime.memory_limit_bytes(),
        max_stack_size: config.runtime.max_stack_bytes(),
    });
    let host = HostContext::from_config(&config, env, runtime.handle().clone());
    tracing::debug!(workspace = %host.workspace_root.display(), "Starting weft");

    match cli.command {
        Command::New { document, typescript } => new_component(host, &document, typescript),
        Command::Build { document } => build(host, &document),
        Command::Run {
            document,
            inputs,
            debug,
        } => {
            let debug = debug.or(config.runtime.debugger_port);
            run(host, &document, &inputs, debug)
        }
        Command::Watch {
            document,
            inputs,
            open,
        } => watch(&runtime, host, &document, &inputs, open),
        Command::Slots { document, edit } => slots(host, &document, edit),
        Command::Doctor => doctor(&runtime),
    }
}

fn doctor(runtime: &Runtime) -> Result<()> {
    let statuses = runtime.block_on(toolchain::doctor());
    let mut missing_required = false;
    for status in &statuses {
        match &status.version {
            Some(version) => println!("ok       {:<6} {version}", status.name),
            None => {
                let label = if status.required { "missing" } else { "absent" };
                println!("{label:<8} {:<6} {}", status.name, status.hint);
                missing_required |= status.required;
            }
        }
    }
    if missing_required {
        bail!("required tools are missing");
    }
    Ok(())
}

fn new_component(host: HostContext, document: &Path, typescript: bool) -> Result<()> {
    if document.exists() {
        bail!("{} already exists", document.display());
    }
    let language = if typescript {
        Language::TypeScript
    } else {
        Language::JavaScript
    };
    let mut component = ScriptComponent::create(host, language)?;
    component.edit_source()?;
    wait_for_build(&mut component)?;
    write_document(document, &component.save()?)?;
    component.remove()?;
    println!("created {}", document.display());
    Ok(())
}

fn build(host: HostContext, document: &Path) -> Result<()> {
    let mut component = ScriptComponent::restore(host, &read_document(document)?)?;
    component.rebuild()?;
    wait_for_build(&mut component)?;
    write_document(document, &component.save()?)?;
    component.remove()?;
    println!("built {}", document.display());
    Ok(())
}

fn run(host: HostContext, document: &Path, inputs: &[String], debug: Option<u16>) -> Result<()> {
    let env = host.env.clone();
    let mut component = ScriptComponent::restore(host, &read_document(document)?)?;
    let mut data = solve_data(&component, inputs)?;

    if let Some(port) = debug {
        let port = env.enable_debugger(port)?;
        eprintln!("Waiting for an inspector client on 127.0.0.1:{port}");
    }
    let report = component.solve(&mut data);
    print_report(&component, &report, &data)?;
    component.remove()?;
    if report.has_errors() {
        bail!("solve failed");
    }
    Ok(())
}

fn watch(runtime: &Runtime, host: HostContext, document: &Path, inputs: &[String], open: bool) -> Result<()> {
    let mut component = ScriptComponent::restore(host, &read_document(document)?)?;
    let entry = component.edit_source()?;
    println!("{}", entry.display());
    eprintln!("Watching {} (Ctrl-C to stop)", entry.display());
    if open
        && let Some(dir) = component.store().source_dir()
        && !runtime.block_on(toolchain::open_in_editor(dir, &entry))
    {
        eprintln!("Could not open an editor; the source is in {}", dir.display());
    }

    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    runtime.spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        flag.store(true, Ordering::SeqCst);
    });

    while !stop.load(Ordering::SeqCst) {
        if component.wait_for_events(WATCH_POLL) > 0 {
            match component.save() {
                Ok(saved) => write_document(document, &saved)?,
                Err(e) => tracing::warn!(error = %e, "Could not save the component"),
            }
        }
        if !component.is_expired() {
            continue;
        }
        let mut data = solve_data(&component, inputs)?;
        let report = component.solve(&mut data);
        print_report(&component, &report, &data)?;
    }

    write_document(document, &component.save()?)?;
    component.remove()?;
    Ok(())
}

fn slots(host: HostContext, document: &Path, edit: Option<SlotEdit>) -> Result<()> {
    let mut component = ScriptComponent::restore(host, &read_document(document)?)?;
    if let Some(edit) = edit {
        component.edit_schema(|schema| -> Result<()> {
            match edit {
                SlotEdit::Add { side } => {
                    schema.add_slot(side.into());
                }
                SlotEdit::Remove { side, index } => {
                    schema.remove_slot(side.into(), index)?;
                }
                SlotEdit::Rename { side, index, name } => {
                    schema.rename(side.into(), index, name)?;
                }
                SlotEdit::Access { side, index, access } => {
                    schema.set_access(side.into(), index, access.into())?;
                }
                SlotEdit::Optional { side, index, optional } => {
                    schema.set_optional(side.into(), index, optional)?;
                }
                SlotEdit::Hint { side, index, hint } => {
                    schema.set_type_hint(side.into(), index, parse_type_hint(&hint))?;
                }
                SlotEdit::Channel { enabled } => {
                    schema.set_output_channel(enabled);
                }
            }
            Ok(())
        })?;
        write_document(document, &component.save()?)?;
    }

    let schema = component.schema();
    for (index, slot) in schema.inputs().iter().enumerate() {
        print_slot("input", index, slot);
    }
    if schema.output_channel() {
        println!("output {:>2}  out  (console output)", 0);
    }
    for (position, slot) in schema.outputs().iter().enumerate() {
        print_slot("output", schema.output_index(position), slot);
    }
    if let Status::InvalidParameters(e) = component.status() {
        eprintln!("warning: {e}");
    }
    component.remove()?;
    Ok(())
}

fn print_slot(side: &str, index: usize, slot: &weft_core::ParameterSlot) {
    let access = match slot.access {
        Access::Item => "item",
        Access::List => "list",
        Access::Tree => "tree",
    };
    let optional = if slot.optional { "  optional" } else { "" };
    println!(
        "{side:<6} {index:>2}  {}  {access}  {}{optional}",
        slot.variable_name,
        slot.type_hint.declared_type()
    );
}

fn parse_type_hint(hint: &str) -> TypeHint {
    match hint.to_ascii_lowercase().as_str() {
        "any" => TypeHint::Any,
        "number" => TypeHint::Number,
        "string" => TypeHint::String,
        "boolean" | "bool" => TypeHint::Boolean,
        "date" => TypeHint::Date,
        _ => TypeHint::Host(hint.to_string()),
    }
}

/// Block until the watcher reports a finished build.
fn wait_for_build(component: &mut ScriptComponent) -> Result<()> {
    let finished = |c: &ScriptComponent| {
        c.watcher_metrics()
            .map_or(0, |m| m.builds_succeeded + m.builds_failed)
    };
    let before = finished(component);
    let deadline = Instant::now() + BUILD_TIMEOUT;
    while finished(component) == before {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            bail!("timed out waiting for the build");
        }
        component.wait_for_events(remaining);
    }
    component.pump();

    if component.status() == Status::BuildFailed {
        for diagnostic in component.build_diagnostics() {
            eprintln!("[{}] {}", diagnostic.level, diagnostic.text());
        }
        bail!("build failed");
    }
    Ok(())
}

fn solve_data(component: &ScriptComponent, inputs: &[String]) -> Result<SolveData> {
    let mut data = SolveData::new();
    for input in inputs {
        let (name, raw) = input
            .split_once('=')
            .with_context(|| format!("input `{input}` is not NAME=VALUE"))?;
        let index = component
            .schema()
            .inputs()
            .iter()
            .position(|slot| slot.variable_name == name)
            .with_context(|| format!("no input named `{name}`"))?;
        let value = serde_json::from_str(raw)
            .map(|json| host_value_from_json(&json))
            .unwrap_or_else(|_| HostValue::Text(raw.to_string()));
        data = match value {
            HostValue::List(items) => data.with_list(index, items),
            value => data.with_item(index, value),
        };
    }
    Ok(data)
}

fn print_report(component: &ScriptComponent, report: &SolveReport, data: &SolveData) -> Result<()> {
    for message in &report.messages {
        eprintln!("{message}");
    }
    if !report.executed {
        return Ok(());
    }
    let schema = component.schema();
    let mut outputs = serde_json::Map::new();
    if schema.output_channel()
        && let Some(channel) = data.output(0)
    {
        outputs.insert("out".into(), host_value_to_json(&channel.clone().into_host_value()));
    }
    for (position, slot) in schema.outputs().iter().enumerate() {
        if let Some(value) = data.output(schema.output_index(position)) {
            outputs.insert(
                slot.variable_name.clone(),
                host_value_to_json(&value.clone().into_host_value()),
            );
        }
    }
    println!("{}", serde_json::to_string_pretty(&outputs)?);
    Ok(())
}

fn read_document(path: &Path) -> Result<ComponentDocument> {
    let text = std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    ComponentDocument::from_json(&text).with_context(|| format!("{} is not a weft component", path.display()))
}

fn write_document(path: &Path, document: &ComponentDocument) -> Result<()> {
    std::fs::write(path, document.to_json()?).with_context(|| format!("cannot write {}", path.display()))
}
