use std::path::PathBuf;

use kiln_workload::{LogEvent, Workload};

mod compose;
mod controller;
mod error;
mod events;
mod interpreter;
mod provision;
mod support;
mod sysproc;
mod template;

use controller::WorkloadRuntime;
use events::LogSink;
use provision::{DeregisterPolicy, Provisioner};
use support::InstallPaths;

const DEFAULT_NETWORK: &str = "kiln-net";

fn usage() -> ! {
    eprintln!(
        "usage: kiln-agent <command> [args]\n\
         \n\
         commands:\n\
         \x20 provision [network]                       prepare the install root\n\
         \x20 register <name> <port> [notebook-port]    add a containerized workload\n\
         \x20 deregister <name> [--remove-service]      remove a workload registration\n\
         \x20 start <name> <port> <root-path>           run a workload process\n\
         \x20 stop <name> <port> <root-path>            stop a workload process\n\
         \n\
         environment: KILN_DATA_ROOT, KILN_NETWORK, RUST_LOG"
    );
    std::process::exit(2);
}

fn parse_port(raw: &str) -> u16 {
    raw.parse().unwrap_or_else(|_| {
        eprintln!("invalid port: {raw}");
        std::process::exit(2);
    })
}

fn network_name() -> String {
    std::env::var("KILN_NETWORK").unwrap_or_else(|_| DEFAULT_NETWORK.to_string())
}

fn print_event(ev: &LogEvent) {
    println!("[{}] {:<7} {}", ev.timestamp, format!("{:?}", ev.severity), ev.message);
}

async fn print_tail(sink: &LogSink) {
    let (events, _) = sink.tail_after(0, 50).await;
    for ev in &events {
        print_event(ev);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else { usage() };

    let paths = InstallPaths::from_env();

    match command.as_str() {
        "provision" => {
            let network = args.get(1).cloned().unwrap_or_else(network_name);
            let sink = LogSink::default();
            let prov = Provisioner::new(paths, sink.clone(), DeregisterPolicy::default());
            let res = prov.provision_install(&network).await;
            print_tail(&sink).await;
            res?;
        }
        "register" => {
            let (Some(name), Some(port)) = (args.get(1), args.get(2)) else {
                usage()
            };
            let workload = Workload {
                name: name.clone(),
                port: parse_port(port),
                notebook_port: args.get(3).map(|p| parse_port(p)),
                network_name: network_name(),
                root_path: paths.workload_dir(name),
            };
            let sink = LogSink::default();
            let prov = Provisioner::new(paths, sink.clone(), DeregisterPolicy::default());
            let outcome = prov.register_container_workload(&workload).await;
            print_tail(&sink).await;
            if !outcome.success {
                anyhow::bail!(outcome.error.unwrap_or_else(|| "registration failed".into()));
            }
        }
        "deregister" => {
            let Some(name) = args.get(1) else { usage() };
            let policy = if args.iter().any(|a| a == "--remove-service") {
                DeregisterPolicy::RemoveServiceBlock
            } else {
                DeregisterPolicy::KeepServiceBlock
            };
            let sink = LogSink::default();
            let prov = Provisioner::new(paths, sink.clone(), policy);
            let outcome = prov.deregister_workload(name).await;
            print_tail(&sink).await;
            if !outcome.success {
                anyhow::bail!("deregistration failed");
            }
        }
        "start" => {
            let (Some(name), Some(port), Some(root)) = (args.get(1), args.get(2), args.get(3))
            else {
                usage()
            };
            let workload = Workload {
                name: name.clone(),
                port: parse_port(port),
                notebook_port: None,
                network_name: network_name(),
                root_path: PathBuf::from(root),
            };
            // Long-running command: stream events live off the forwarder.
            let (sink, mut log_rx) = LogSink::with_forwarder();
            let printer = tokio::spawn(async move {
                while let Some(ev) = log_rx.recv().await {
                    print_event(&ev);
                }
            });

            let runtime = WorkloadRuntime::new(paths, sink.clone());
            let outcome = runtime.start(&workload).await;
            if !outcome.success {
                anyhow::bail!("start failed");
            }
            tracing::info!(name = %name, pid = outcome.pid, "workload started, ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            runtime.stop(&workload).await;
            runtime.wait_stopped(&workload).await;
            if let Some(status) = runtime.status(name).await {
                tracing::info!(name = %name, state = ?status.state, "final workload state");
            }

            drop(runtime);
            drop(sink);
            printer.await.ok();
        }
        "stop" => {
            let (Some(name), Some(port), Some(root)) = (args.get(1), args.get(2), args.get(3))
            else {
                usage()
            };
            let workload = Workload {
                name: name.clone(),
                port: parse_port(port),
                notebook_port: None,
                network_name: network_name(),
                root_path: PathBuf::from(root),
            };
            let sink = LogSink::default();
            let runtime = WorkloadRuntime::new(paths, sink.clone());
            let outcome = runtime.stop(&workload).await;
            if outcome.success && !runtime.wait_stopped(&workload).await {
                tracing::warn!(name = %name, "port still occupied after stop window");
            }
            print_tail(&sink).await;
        }
        _ => usage(),
    }

    Ok(())
}
