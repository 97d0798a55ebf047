// Demo: a talker and a listener node sharing one in-process registry.
use anyhow::Result;
use clap::Parser;
use roslink_msgs::std_msgs;
use roslink_node::{Callback, Node, NodeConfig};
use roslink_registry::{InMemoryRegistry, Registry};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "chatter")]
#[command(about = "Run a talker and a listener against an in-process registry")]
struct Args {
    /// Topic name
    #[arg(long, default_value = "/chatter")]
    topic: String,

    /// Number of messages to publish
    #[arg(long, default_value = "10")]
    count: u32,

    /// Delay between publishes in milliseconds
    #[arg(long, default_value = "500")]
    period_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let registry = Arc::new(InMemoryRegistry::new());

    let listener = Arc::new(Node::new(
        "/listener",
        registry.clone() as Arc<dyn Registry>,
        NodeConfig::from_env(),
    ));
    let updates = registry.attach_node(listener.api_uri()).await;
    listener.drive_topology_updates(updates);
    let spin_task = {
        let node = Arc::clone(&listener);
        tokio::spawn(async move { node.spin().await })
    };
    listener
        .subscribe(
            &args.topic,
            Callback::message_and_event(|message: &std_msgs::String, event| {
                info!(from = %event.publisher_name, data = %message.data, "received");
            }),
        )
        .await?;

    let talker = Arc::new(Node::new(
        "/talker",
        registry.clone() as Arc<dyn Registry>,
        NodeConfig::from_env(),
    ));
    let addr = talker.bind_data_listener().await?;
    registry.set_data_addr(talker.api_uri(), addr).await;
    let publisher = talker.advertise::<std_msgs::String>(&args.topic).await?;

    for index in 0..args.count {
        let message = std_msgs::String {
            data: format!("hello {index}"),
        };
        info!(data = %message.data, "publishing");
        publisher.publish(&message).await?;
        tokio::time::sleep(Duration::from_millis(args.period_ms)).await;
    }

    talker.shutdown().await;
    listener.shutdown().await;
    spin_task.await?;
    Ok(())
}
