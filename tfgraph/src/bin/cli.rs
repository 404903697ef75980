use std::{io::Write, path::PathBuf};

use anyhow::{Context, ensure};
use clap::{Parser, Subcommand, ValueEnum};
use tfgraph::{
    DeviceType, GraphCodec, JsonCodec, MsgPackCodec, PipelineOptions, ir::Program, lower_program,
};
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Lower a program to a device partitioned graph.
    Lower {
        /// Path to the JSON encoded program.
        #[arg(short, long, env = "TFGRAPH_INPUT")]
        input: PathBuf,

        /// Host name of the entry function.
        #[arg(short, long, env = "TFGRAPH_ENTRY", default_value = "main")]
        entry: String,

        /// Where to write the encoded graph.
        #[arg(short, long, env = "TFGRAPH_OUTPUT")]
        output: PathBuf,

        #[arg(short, long, env = "TFGRAPH_FORMAT", value_enum, default_value_t = Format::Msgpack)]
        format: Format,

        /// Overrides the primary device declared by each function.
        #[arg(long, env = "TFGRAPH_PRIMARY_DEVICE", value_enum)]
        primary_device: Option<Device>,

        /// Use infeed/outfeed for host transfers on TPU.
        #[arg(long, env = "TFGRAPH_INFEED")]
        infeed: bool,
    },

    /// Print the functions of an encoded graph.
    Inspect {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long, value_enum, default_value_t = Format::Msgpack)]
        format: Format,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Msgpack,
    Json,
}

impl Format {
    fn codec(self) -> Box<dyn GraphCodec> {
        match self {
            Format::Msgpack => Box::new(MsgPackCodec),
            Format::Json => Box::new(JsonCodec { pretty: true }),
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Device {
    Cpu,
    Gpu,
    Tpu,
}

impl From<Device> for DeviceType {
    fn from(device: Device) -> Self {
        match device {
            Device::Cpu => DeviceType::Cpu,
            Device::Gpu => DeviceType::Gpu,
            Device::Tpu => DeviceType::Tpu,
        }
    }
}

fn lower(
    input: PathBuf,
    entry: String,
    output: PathBuf,
    format: Format,
    options: PipelineOptions,
) -> anyhow::Result<()> {
    let program: Program = serde_json::from_slice(
        &std::fs::read(&input).with_context(|| format!("reading {}", input.display()))?,
    )
    .with_context(|| format!("parsing program {}", input.display()))?;
    program.verify().context("invalid program")?;
    ensure!(
        program.function(&entry).is_some(),
        "no function named {entry} in {}",
        input.display()
    );

    let lowered = lower_program(&program, &entry, &options).inspect_err(|e| error!("{}", e.diagnostic()))?;
    let bytes = lowered.serialize(format.codec().as_ref())?;
    std::fs::write(&output, &bytes).with_context(|| format!("writing {}", output.display()))?;
    info!(
        "wrote {} functions ({} bytes) to {}",
        lowered.assembly.graph.len(),
        bytes.len(),
        output.display()
    );
    Ok(())
}

fn inspect(input: PathBuf, format: Format) -> anyhow::Result<()> {
    let bytes = std::fs::read(&input).with_context(|| format!("reading {}", input.display()))?;
    let assembly = format.codec().decode(&bytes)?;
    let mut out = std::io::stdout().lock();
    writeln!(out, "entry: {}", assembly.entry)?;
    for helper in &assembly.helpers {
        writeln!(out, "helper: {helper}")?;
    }
    for function in assembly.graph.functions() {
        writeln!(
            out,
            "{}: {} inputs, {} outputs, {} nodes",
            function.name,
            function.inputs.len(),
            function.outputs.len(),
            function.nodes.len()
        )?;
        for node in &function.nodes {
            writeln!(out, "  {} = {} @ {}", node.name, node.op, node.device)?;
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_level(true)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Setting up logging failed")?;

    let args = Args::parse();

    match args.command {
        Command::Lower {
            input,
            entry,
            output,
            format,
            primary_device,
            infeed,
        } => {
            let options = PipelineOptions {
                primary_device: primary_device.map(Into::into),
                infeed: infeed.then_some(true),
                remove_config_inst: true,
            };
            lower(input, entry, output, format, options)
        }
        Command::Inspect { input, format } => inspect(input, format),
    }
}
