//! workerlink probe: spawn a supervised worker, connect, optionally make one call.

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use workerlink::{ConnectionState, Controller, ControllerConfig, SupervisorConfig, WorkerScript};

struct ProbeArgs {
    binary: PathBuf,
    script: PathBuf,
    call: Option<(String, String, Vec<serde_json::Value>)>,
    timeout: Duration,
    extra: Vec<String>,
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("WORKERLINK_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("workerlink={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let probe = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!(
                "Usage: workerlink <binary> <script> [--call <namespace> <function> [<json-args>]] [--timeout <secs>] [-- <worker args>...]"
            );
            eprintln!();
            eprintln!("Arguments:");
            eprintln!("  <binary>         Worker executable, resolved through PATH");
            eprintln!("  <script>         Script passed to the worker");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --call <ns> <fn> [<json>]  Call once and print the result; args are a JSON array");
            eprintln!("  --timeout <secs>           Wait this long for the connection [default: 60]");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(probe).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<ProbeArgs, String> {
    let mut positional: Vec<String> = Vec::new();
    let mut call = None;
    let mut timeout = Duration::from_secs(60);
    let mut extra = Vec::new();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--" => {
                extra = args[i + 1..].to_vec();
                break;
            }
            "--call" => {
                let namespace = args.get(i + 1).ok_or("--call requires a namespace")?;
                let function = args.get(i + 2).ok_or("--call requires a function")?;
                i += 2;
                let call_args = match args.get(i + 1) {
                    Some(raw) if !raw.starts_with("--") => {
                        i += 1;
                        parse_call_args(raw)?
                    }
                    _ => Vec::new(),
                };
                call = Some((namespace.clone(), function.clone(), call_args));
            }
            "--timeout" => {
                i += 1;
                let secs = args.get(i).ok_or("--timeout requires a value")?;
                let secs: u64 = secs
                    .parse()
                    .map_err(|_| format!("invalid --timeout value: {secs}"))?;
                timeout = Duration::from_secs(secs);
            }
            "--help" | "-h" => return Err("".to_string()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let mut positional = positional.into_iter();
    let binary = positional
        .next()
        .ok_or("missing required argument: <binary>")?;
    let script = positional
        .next()
        .ok_or("missing required argument: <script>")?;
    if let Some(unexpected) = positional.next() {
        return Err(format!("unexpected argument: {unexpected}"));
    }

    Ok(ProbeArgs {
        binary: PathBuf::from(binary),
        script: PathBuf::from(script),
        call,
        timeout,
        extra,
    })
}

fn parse_call_args(raw: &str) -> Result<Vec<serde_json::Value>, String> {
    match serde_json::from_str(raw) {
        Ok(serde_json::Value::Array(values)) => Ok(values),
        Ok(_) => Err("call arguments must be a JSON array".to_string()),
        Err(e) => Err(format!("invalid call arguments: {e}")),
    }
}

async fn run(probe: ProbeArgs) -> anyhow::Result<()> {
    let ProbeArgs {
        binary,
        script,
        call,
        timeout,
        extra,
    } = probe;

    let config = ControllerConfig::default()
        .with_supervisor(SupervisorConfig::new(binary))
        .with_worker_script(WorkerScript::Path(script))
        .with_worker_args(extra);
    let controller = Controller::new(config);

    let working_dir = std::env::current_dir().context("failed to resolve working directory")?;
    let port = controller.connect_managed(working_dir).await?;
    tracing::info!(port, "Worker launched, waiting for connection");

    let mut state = controller.subscribe_state();
    let connected = tokio::time::timeout(
        timeout,
        state.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    // Release the watch borrow before anything can publish a new state.
    .map(|waited| waited.map(|_| ()));
    match connected {
        Ok(Ok(())) => {}
        Ok(Err(_)) => anyhow::bail!("controller dropped before connecting"),
        Err(_) => {
            controller.disconnect().await;
            anyhow::bail!("worker did not accept a connection within {timeout:?}");
        }
    }

    let outcome = match call {
        Some((namespace, function, args)) => {
            let result = controller
                .call(&namespace, &function, args)
                .await
                .with_context(|| format!("{namespace}.{function} failed"));
            result.and_then(|value| {
                let pretty = serde_json::to_string_pretty(&value)?;
                println!("{pretty}");
                Ok(())
            })
        }
        None => {
            tracing::info!("Connected; press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")
        }
    };

    controller.disconnect().await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("workerlink")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parses_call_and_extra_args() {
        let probe = parse_args(&argv(&[
            "node",
            "server.js",
            "--call",
            "nodes",
            "getNode",
            r#"["42"]"#,
            "--timeout",
            "5",
            "--",
            "--storagePath",
            "/var/lib/worker",
        ]))
        .unwrap();

        assert_eq!(probe.binary, PathBuf::from("node"));
        assert_eq!(probe.script, PathBuf::from("server.js"));
        let (ns, func, args) = probe.call.unwrap();
        assert_eq!((ns.as_str(), func.as_str()), ("nodes", "getNode"));
        assert_eq!(args, vec![serde_json::json!("42")]);
        assert_eq!(probe.timeout, Duration::from_secs(5));
        assert_eq!(probe.extra, vec!["--storagePath", "/var/lib/worker"]);
    }

    #[test]
    fn call_args_are_optional() {
        let probe = parse_args(&argv(&["node", "server.js", "--call", "nodes", "listNodes"])).unwrap();
        let (_, _, args) = probe.call.unwrap();
        assert!(args.is_empty());
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_args(&argv(&["node"])).is_err());
        assert!(parse_args(&argv(&["node", "a.js", "b.js"])).is_err());
        assert!(parse_args(&argv(&["node", "a.js", "--bogus"])).is_err());
        assert!(parse_args(&argv(&["node", "a.js", "--call", "nodes", "f", "{}"])).is_err());
        assert!(parse_args(&argv(&["node", "a.js", "--timeout", "soon"])).is_err());
    }
}
