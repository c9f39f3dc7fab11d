use std::io::Write;

use local_llm_bridge::{
    client::{
        consumer::{ConsumerError, ExchangeSnapshot},
        store_from_config, ChatConsumer, Conversation, ExchangePhase,
    },
    config::ClientConfig,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,local_llm_bridge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = ClientConfig::from_env();
    let store = store_from_config(&config);
    let consumer = ChatConsumer::new(config.bridge_url.clone(), store.clone())?;
    let mut conversation = match config.resume_session {
        Some(session_id) => {
            let conversation =
                Conversation::resume(store.as_ref(), session_id, config.system_prompt.clone())
                    .await?;
            eprintln!(
                "resuming \"{}\" ({} messages)",
                conversation.name,
                conversation.transcript().len()
            );
            conversation
        }
        None => Conversation::new(
            config.model.clone(),
            config.system_prompt.clone(),
            config.temperature,
        ),
    };
    let mut updates = consumer.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    eprintln!(
        "chatting with {} via {} (ctrl-c stops a reply, /quit exits)",
        conversation.model, config.bridge_url
    );

    loop {
        prompt()?;
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }

        let stop = CancellationToken::new();
        let send = consumer.send(&mut conversation, line, stop.clone());
        tokio::pin!(send);
        let mut printed = 0;
        let result = loop {
            tokio::select! {
                result = &mut send => break result,
                Ok(()) = updates.changed() => echo(&updates.borrow_and_update(), &mut printed)?,
                _ = tokio::signal::ctrl_c(), if !stop.is_cancelled() => stop.cancel(),
            }
        };
        echo(&updates.borrow_and_update(), &mut printed)?;
        println!();

        match result {
            Ok(outcome) => {
                if outcome.phase == ExchangePhase::Cancelled {
                    eprintln!("[stopped]");
                }
                if let Some(error) = outcome.persist_error {
                    eprintln!("[reply not saved: {error}]");
                }
            }
            Err(ConsumerError::Model(error)) => {
                eprintln!("{}", error.title);
                for line in &error.message_lines {
                    eprintln!("  {line}");
                }
                eprintln!("  {}", error.suggestion);
            }
            Err(error) => eprintln!("{error}"),
        }
    }

    match conversation.session_id {
        Some(session_id) => eprintln!(
            "{}: {} messages, resume with BRIDGE_SESSION_ID={session_id}",
            conversation.name,
            conversation.transcript().len()
        ),
        None => eprintln!("{}: {} messages", conversation.name, conversation.transcript().len()),
    }
    Ok(())
}

fn prompt() -> std::io::Result<()> {
    let mut stdout = std::io::stdout();
    write!(stdout, "> ")?;
    stdout.flush()
}

/// Prints whatever part of the cumulative reply has not been shown yet.
fn echo(snapshot: &ExchangeSnapshot, printed: &mut usize) -> std::io::Result<()> {
    let content = &snapshot.content;
    if content.len() <= *printed || !content.is_char_boundary(*printed) {
        return Ok(());
    }
    let mut stdout = std::io::stdout();
    write!(stdout, "{}", &content[*printed..])?;
    stdout.flush()?;
    *printed = content.len();
    Ok(())
}
