use anyhow::Result;
use clap::Parser;
use shared::domain::{ScopeId, UserId};
use sync_core::{Session, SyncClient, SyncEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: String,
    #[arg(long)]
    viewer_id: i64,
    #[arg(long)]
    token: String,
    #[arg(long)]
    scope_id: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let scope_id = ScopeId(args.scope_id);
    let client = SyncClient::connect(
        &args.server_url,
        Session {
            viewer_id: UserId(args.viewer_id),
            identity_token: args.token,
        },
    );
    let conversation = client.open_conversation(scope_id).await?;
    let board = client.open_summary_board(vec![scope_id]).await?;
    client.set_visibility(true);

    for entry in conversation.messages().await {
        println!("[{}] {}: {}", entry.sent_at, entry.sender_id.0, entry.content);
    }
    println!(
        "summaries: {}",
        serde_json::to_string(&board.summaries().await.values().collect::<Vec<_>>())?
    );

    {
        let conversation = conversation.clone();
        let board = board.clone();
        let mut events = client.subscribe_events();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    SyncEvent::MessageListChanged { .. } => {
                        if let Some(entry) = conversation.messages().await.last() {
                            println!(
                                "[{}] {}: {}",
                                entry.sent_at, entry.sender_id.0, entry.content
                            );
                        }
                    }
                    SyncEvent::MessageSendFailed { restored_draft, .. } => {
                        println!("send failed; draft restored: {restored_draft}");
                    }
                    SyncEvent::SummariesChanged => {
                        if let Some(summary) = board.summary(scope_id).await {
                            println!(
                                "unread: {} pending approvals: {}",
                                summary.unread_updates, summary.pending_approvals
                            );
                        }
                    }
                    SyncEvent::Error(message) => warn!("engine error: {message}"),
                }
            }
        });
    }

    // Each stdin line becomes one message send; EOF tears everything down.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        conversation.set_draft(line).await;
        if let Err(err) = conversation.send().await {
            warn!(error = %err, "send failed");
        }
    }

    conversation.close().await;
    board.close().await;
    client.shutdown().await;
    Ok(())
}
