use std::sync::Arc;

use hop::cache::Cache;
use hop::chord::ChordRouter;
use hop::ops::Hop;
use hop::range::RangeRouter;
use hop::server::Server;
use hop::store::MemStore;
use hop::transport;

fn usage(prog: &str) -> ! {
    eprintln!("Usage: {} --bind <addr:port> [options]", prog);
    eprintln!("  --proto <name>           transport protocol (default tcp)");
    eprintln!("  --router <none|range|chord>");
    eprintln!("  --master <addr:port>     range: master to join (omit to be the master)");
    eprintln!("  --node <addr:port>       chord: any ring member to join through");
    eprintln!("  --cache <maxmem>:<maxelem>  front the store with a write-through cache");
    eprintln!();
    eprintln!("Example: {} --bind 127.0.0.1:5004", prog);
    eprintln!(
        "Example: {} --bind 127.0.0.1:5005 --router chord --node 127.0.0.1:5004",
        prog
    );

    std::process::exit(1);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let prog = args[0].clone();

    let mut bind = String::new();
    let mut proto = "tcp".to_string();
    let mut router = "none".to_string();
    let mut master = String::new();
    let mut node = String::new();
    let mut cache_caps: Option<(u64, usize)> = None;

    let mut i = 1;
    while i < args.len() {
        let need = |i: usize| {
            if i + 1 >= args.len() {
                usage(&prog);
            }
            args[i + 1].clone()
        };

        match args[i].as_str() {
            "--bind" => {
                bind = need(i);
                i += 2;
            }
            "--proto" => {
                proto = need(i);
                i += 2;
            }
            "--router" => {
                router = need(i);
                i += 2;
            }
            "--master" => {
                master = need(i);
                i += 2;
            }
            "--node" => {
                node = need(i);
                i += 2;
            }
            "--cache" => {
                let spec = need(i);
                let Some((mem, elem)) = spec.split_once(':') else {
                    usage(&prog);
                };
                cache_caps = Some((mem.parse()?, elem.parse()?));
                i += 2;
            }
            _ => usage(&prog),
        }
    }

    if bind.is_empty() {
        usage(&prog);
    }

    tracing::info!("starting hopd on {}", bind);

    // the op graph: leaf store, optional cache, optional router
    let store = MemStore::new();
    let mut hop: Arc<dyn Hop> = store;
    if let Some((maxmem, maxelem)) = cache_caps {
        tracing::info!("cache enabled: {} bytes, {} elements", maxmem, maxelem);
        hop = Cache::new(hop, maxmem, maxelem);
    }

    match router.as_str() {
        "none" => {
            let srv = Server::new(hop);
            let addr = transport::listen(&proto, &bind, srv).await?;
            tracing::info!("serving on {}", addr);
        }
        "range" => {
            let r = RangeRouter::new(&proto, &bind, &master, Some(hop)).await?;
            tracing::info!("range router serving on {}", r.addr());
        }
        "chord" => {
            let r = ChordRouter::new(&proto, &bind, &node, Some(hop)).await?;
            tracing::info!("chord node serving on {}", r.addr());
        }
        other => {
            anyhow::bail!("unknown router: {}", other);
        }
    }

    // serve until killed
    std::future::pending::<()>().await;
    Ok(())
}
