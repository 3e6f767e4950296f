//! Two channels over a local TCP connection exchanging typed values.

use serde::{Deserialize, Serialize};
use wirechan::{connect_tcp, Config, Listener, Registry, Result};

/// A value both ends know about.
#[derive(Serialize, Deserialize, Default, Debug)]
struct Point {
    x: i64,
    y: i64,
}

fn registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .register::<String>("greeting")
        .and_then(|r| r.register::<Point>("point"))
        .expect("names are unique");
    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    let listener = Listener::new(registry()).tcp("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        let mut server = listener.accept().await?;
        while let Some(message) = server.recv().await {
            match message.name() {
                "greeting" => {
                    let greeting = message.downcast::<String>().unwrap_or_default();
                    server.send(format!("{} yourself", greeting)).await?;
                }
                "point" => {
                    if let Ok(p) = message.downcast::<Point>() {
                        server.send(Point { x: p.y, y: p.x }).await?;
                    }
                }
                _ => {}
            }
        }
        server.close();
        Ok::<_, wirechan::ChannelError>(())
    });

    let client = connect_tcp(&addr.to_string(), registry(), Config::default()).await?;
    let (sender, mut inbound, mut errors) = client.split();
    sender.send(String::from("hello")).await?;
    sender.send(Point { x: 1, y: 2 }).await?;

    for _ in 0..2 {
        tokio::select! {
            Some(message) = inbound.recv() => {
                if let Some(text) = message.downcast_ref::<String>() {
                    println!("{}: {}", message.name(), text);
                } else if let Some(point) = message.downcast_ref::<Point>() {
                    println!("{}: {:?}", message.name(), point);
                }
            }
            err = errors.recv() => println!("error: {}", err),
        }
    }
    sender.close();
    Ok(())
}
