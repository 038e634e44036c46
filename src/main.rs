//! Lockstep CLI - Main entry point.

use lockstep::cli::{Cli, Commands};
use lockstep::config::LockstepConfig;
use lockstep::lock::AuthorityStatsSnapshot;
use lockstep::transport::http::{ProposeRequest, ProposeResponse, ViewStatus};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    match cli.command {
        Commands::Serve {
            node_id,
            bind_addr,
            peers,
            data_dir,
            backup,
        } => {
            // Build configuration from the file if given; CLI args win
            let mut config = match &cli.config {
                Some(path) => LockstepConfig::from_file(path)?,
                None => LockstepConfig::development(),
            };
            config.node.id = node_id;
            config.node.bind_addr = bind_addr.parse()?;
            config.node.data_dir = data_dir;
            config.node.primary = !backup;

            if let Some(peers_str) = peers {
                config.consensus.peers = peers_str.split(',').map(|s| s.to_string()).collect();
            }

            config.observability.log_level = cli.log_level;

            lockstep::run(config).await?;
        }

        Commands::Status { addr } => {
            match reqwest::get(format!("http://{}/health", addr)).await {
                Ok(response) => {
                    println!("Replica status ({})", addr);
                    println!(
                        "Health: {}",
                        if response.status().is_success() {
                            "OK"
                        } else {
                            "DEGRADED"
                        }
                    );
                }
                Err(e) => {
                    eprintln!("Failed to connect to replica: {}", e);
                    std::process::exit(1);
                }
            }

            match fetch_view(&addr).await {
                Ok(view) if view.instance == 0 => println!("View: none committed"),
                Ok(view) => println!("View {}: {}", view.instance, view.view),
                Err(e) => eprintln!("Failed to fetch view: {}", e),
            }

            match fetch_stats(&addr).await {
                Ok(stats) => {
                    println!("Acquires granted: {}", stats.acquires_granted);
                    println!("Retries returned: {}", stats.retries_returned);
                    println!("Revokes sent: {}", stats.revokes_sent);
                    println!("Retry callbacks sent: {}", stats.retries_sent);
                }
                Err(e) => eprintln!("Failed to fetch stats: {}", e),
            }
        }

        Commands::ProposeView { addr, view } => {
            let client = reqwest::Client::new();
            let response = client
                .post(format!("http://{}/paxos/propose", addr))
                .json(&ProposeRequest { value: view })
                .send()
                .await;

            match response {
                Ok(response) => {
                    let outcome: ProposeResponse = response.json().await?;
                    if outcome.decided {
                        println!("View decided as instance {}", outcome.instance);
                    } else {
                        println!(
                            "Round for instance {} did not decide; check the view and retry",
                            outcome.instance
                        );
                    }
                }
                Err(e) => {
                    eprintln!("Failed to connect to replica: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Version => {
            println!("Lockstep v{}", env!("CARGO_PKG_VERSION"));
            println!("A replicated lock service with caching clients");
        }
    }

    Ok(())
}

async fn fetch_stats(addr: &str) -> anyhow::Result<AuthorityStatsSnapshot> {
    Ok(reqwest::get(format!("http://{addr}/lock/stats"))
        .await?
        .json()
        .await?)
}

async fn fetch_view(addr: &str) -> anyhow::Result<ViewStatus> {
    Ok(reqwest::get(format!("http://{addr}/paxos/view"))
        .await?
        .json()
        .await?)
}
