// Glint terminal host: a line-driven stand-in for a camera and screen.
// Frames that would be rendered as QR codes are printed to stdout, and
// pasted lines play the role of scanned codes.

mod config;
mod store;

use std::io::{BufRead, Write as _};

use anyhow::Context;
use clap::Parser;
use glint_core::{DeviceId, Mesh, MeshEvent, SendStatus};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "glint", version, about = "Optical mesh messaging host")]
struct Args {
    /// Display name announced to peers (overrides config file).
    #[arg(long)]
    name: Option<String>,
    /// Identity store file (overrides config file).
    #[arg(long)]
    identity: Option<std::path::PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let cfg = config::load();
    let name = args.name.or(cfg.name);
    let identity_path = args
        .identity
        .or(cfg.identity_path)
        .or_else(|| config::config_dir().map(|d| d.join("identity.toml")))
        .context("cannot determine identity path; set --identity or GLINT_IDENTITY_PATH")?;

    let mut store = store::FileStore::new(identity_path);
    let keypair = glint_core::load_or_create(&mut store)?;
    let mut mesh = Mesh::new(keypair, name);
    println!("glint device {}", mesh.device_id());
    println!("type /help for commands; any other line is fed in as a scanned frame");

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix('/') {
            if !dispatch(&mut mesh, rest) {
                break;
            }
        } else {
            tracing::trace!(len = line.len(), "feeding scanned line");
            mesh.on_scanned(line);
        }
        for event in mesh.drain_events() {
            println!("  {}", render_event(&event));
        }
        std::io::stdout().flush()?;
    }
    Ok(())
}

/// Handle one slash command. Returns false on /quit.
fn dispatch(mesh: &mut Mesh, input: &str) -> bool {
    let mut parts = input.splitn(3, ' ');
    let command = parts.next().unwrap_or_default();
    match command {
        "chat" | "offer" => {
            let (Some(id), Some(text)) = (parts.next(), parts.next()) else {
                println!("usage: /{command} <device-id> <text>");
                return true;
            };
            let Ok(peer) = id.parse::<DeviceId>() else {
                println!("bad device id {id:?} (8 uppercase hex characters)");
                return true;
            };
            let queued = if command == "chat" {
                mesh.send_chat(peer, text)
            } else {
                mesh.send_offer(peer, text)
            };
            match queued {
                Ok(pn) => println!("queued as packet {pn}"),
                Err(e) => println!("error: {e}"),
            }
        }
        "show" => show_next(mesh),
        "tick" => mesh.check_retries(),
        "peers" => {
            for peer in mesh.peers() {
                println!(
                    "  {} {} {} last seen tick {}",
                    peer.id(),
                    peer.name().unwrap_or("-"),
                    if peer.is_active() { "active" } else { "unkeyed" },
                    peer.last_seen(),
                );
                if let Some(offer) = peer.pending_offer() {
                    println!("    pending offer: {offer}");
                }
            }
        }
        "status" => {
            let Some(Ok(peer)) = parts.next().map(str::parse::<DeviceId>) else {
                println!("usage: /status <device-id>");
                return true;
            };
            match mesh.delivery_status(peer) {
                Ok(statuses) => {
                    for s in statuses {
                        let state = match s.status {
                            SendStatus::Pending => "pending",
                            SendStatus::Acked => "acked",
                            SendStatus::Failed => "failed",
                        };
                        println!("  pn {} {} ({} retries)", s.pn, state, s.retries);
                    }
                }
                Err(e) => println!("error: {e}"),
            }
        }
        "history" => {
            let peer = parts.next().and_then(|s| s.parse::<DeviceId>().ok());
            for m in mesh.chat_history(peer) {
                let arrow = match m.direction {
                    glint_core::Direction::Sent => "->",
                    glint_core::Direction::Received => "<-",
                };
                let lock = if m.encrypted { "[enc]" } else { "     " };
                println!("  {arrow} {} {lock} {}", m.peer, m.text);
            }
        }
        "id" => println!("{}", mesh.device_id()),
        "help" => {
            println!("  /chat <id> <text>    queue a chat message");
            println!("  /offer <id> <text>   queue a connection offer");
            println!("  /show                print the next frame(s) to display");
            println!("  /tick                advance the retry clock");
            println!("  /peers               list known peers");
            println!("  /status <id>         delivery status toward a peer");
            println!("  /history [id]        chat history");
            println!("  /id                  print our device id");
            println!("  /quit                exit");
        }
        "quit" | "exit" => return false,
        other => println!("unknown command /{other}; try /help"),
    }
    true
}

fn show_next(mesh: &mut Mesh) {
    match mesh.next_display() {
        Ok((packet, frames)) => {
            for frame in &frames {
                println!("  [{frame}]");
            }
            mesh.mark_displayed(&packet);
        }
        Err(e) => println!("error: cannot frame packet: {e}"),
    }
}

fn render_event(event: &MeshEvent) -> String {
    match event {
        MeshEvent::PeerDiscovered { peer } => format!("peer {peer} discovered"),
        MeshEvent::PeerUpdated { peer } => format!("peer {peer} updated"),
        MeshEvent::PacketSent { peer, pn } => format!("displayed packet {pn} for {peer}"),
        MeshEvent::PacketReceived { peer, pn } => format!("received packet {pn} from {peer}"),
        MeshEvent::PacketAcked { peer, pn } => format!("packet {pn} acknowledged by {peer}"),
        MeshEvent::PacketFailed { peer, pn } => format!("packet {pn} to {peer} failed"),
        MeshEvent::Chat(m) => format!("chat from {}: {}", m.peer, m.text),
        MeshEvent::OfferReceived { peer, offer } => {
            format!("offer from {peer}: {offer} (stored; connect manually)")
        }
        MeshEvent::Error { message } => format!("protocol error: {message}"),
    }
}
