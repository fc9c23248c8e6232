//! A host and two players in one process, talking over real WebSocket
//! links through the host's hub.
//!
//! Run with `RUST_LOG=debug cargo run -p relay-demo` to watch the routing.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hubcall::prelude::*;
use hubcall::transport::{WebSocketClientMessenger, WebSocketServerMessenger};
use serde_json::json;

/// The host's turn tracker. Single-threaded, so turns are applied in the
/// order they reached the host.
fn turn_tracker() -> DispatchTable {
    let turn = Arc::new(AtomicU32::new(1));
    DispatchTable::new("Game").method("end_turn", ["string"], move |ctx, args| {
        let summary: String = decode_arg(args, 0)?;
        let ended = turn.fetch_add(1, Ordering::SeqCst);
        tracing::info!(player = %ctx.calling_node, turn = ended, %summary, "turn ended");
        Ok(json!(ended + 1))
    })
}

/// A player's chat window.
fn chat_window(owner: &'static str) -> DispatchTable {
    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    DispatchTable::new("Chat").method("show", ["string"], move |ctx, args| {
        let line: String = decode_arg(args, 0)?;
        tracing::info!(window = owner, from = %ctx.calling_node, %line, "chat");
        let mut log = log.lock().map_err(|_| RemoteError::new(ErrorKind::IllegalState, "chat log poisoned"))?;
        log.push(line);
        Ok(json!(log.len()))
    })
}

async fn wait_for_owner(host: &UnifiedMessenger, name: &str) -> Result<(), HubcallError> {
    for _ in 0..100 {
        if !host.hub_owners(name).await?.is_empty() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Err(HubcallError::NotFound(name.to_string()))
}

#[tokio::main]
async fn main() -> Result<(), HubcallError> {
    hubcall::init_tracing();

    let server = WebSocketServerMessenger::bind("127.0.0.1:0", "host").await?;
    let addr = server.local_addr().to_string();
    let host = UnifiedMessenger::builder(Arc::new(server)).start()?;

    let alice = UnifiedMessenger::builder(Arc::new(
        WebSocketClientMessenger::connect(&addr, "alice").await?,
    ))
    .start()?;
    let bob = UnifiedMessenger::builder(Arc::new(
        WebSocketClientMessenger::connect(&addr, "bob").await?,
    ))
    .start()?;

    let game = turn_tracker();
    let game_name = RemoteName::new("game", game.capability().clone());
    host.add_implementor(&game_name, Arc::new(game), true)?;

    let chat = chat_window("alice");
    let chat_name = RemoteName::new("chat:alice", chat.capability().clone());
    alice.add_implementor(&chat_name, Arc::new(chat), false)?;
    wait_for_owner(&host, "chat:alice").await?;

    // Players report to the host.
    for (player, summary) in [(&alice, "moved north"), (&bob, "built a farm")] {
        let call = RemoteMethodCall::new("game", "end_turn").arg("string", summary);
        let next = player.invoke_and_wait(call).await?.into_result()?;
        tracing::info!(player = %player.local_node(), %next, "host answered");
    }

    // Bob talks to Alice; the call goes bob → host → alice and back.
    let call = RemoteMethodCall::new("chat:alice", "show").arg("string", "nice farm, right?");
    let lines = bob.invoke_and_wait(call).await?.into_result()?;
    tracing::info!(%lines, "alice's chat window now holds");

    // Fire-and-forget from the host.
    host.invoke(RemoteMethodCall::new("chat:alice", "show").arg("string", "server restarting soon"))
        .await?;

    // A name nobody owns.
    let call = RemoteMethodCall::new("chat:carol", "show").arg("string", "anyone?");
    let missing = bob.invoke_and_wait(call).await?;
    tracing::info!(kind = ?missing.error_kind(), "calling a name nobody owns");

    tokio::time::sleep(Duration::from_millis(100)).await;
    for messenger in [&bob, &alice, &host] {
        messenger.shutdown();
    }
    Ok(())
}
