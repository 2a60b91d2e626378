use std::{io::Write, sync::Arc};

use anyhow::{Context, bail};
use orbroker_app::{LogProgress, OpenRouterProvider, config::AppConfig};
use orbroker_contracts::{ChatMessage, RequestPayload};
use orbroker_core::StreamCallbacks;
use orbroker_observability::init_observability;
use tokio::sync::mpsc;

const DEMO_CALLER_ID: &str = "orbroker-cli";
const FALLBACK_MODEL: &str = "openai/gpt-4o-mini";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_observability("orbroker-app");

    let config = AppConfig::from_env().context("configuration must be valid")?;
    let provider = OpenRouterProvider::from_config(&config, Arc::new(LogProgress))
        .context("provider must initialise")?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("--balance") => println!("{}", provider.balance().await?),
        Some("--models") => {
            for model in provider.list_models().await? {
                let context = model.context_length.map(|tokens| tokens.to_string());
                println!("{}\t{}", model.id, context.as_deref().unwrap_or("-"));
            }
        }
        Some("--set-model") => {
            let Some(model_id) = args.get(1) else { bail!("usage: orbroker-app --set-model <model>") };
            provider.set_model(DEMO_CALLER_ID, model_id)?;
        }
        Some(_) => stream_prompt(&provider, &args.join(" ")).await?,
        None => bail!("usage: orbroker-app <prompt> | --balance | --models | --set-model <model>"),
    }
    Ok(())
}

async fn stream_prompt(provider: &OpenRouterProvider, prompt: &str) -> anyhow::Result<()> {
    let model = provider.model(DEMO_CALLER_ID).unwrap_or_else(|| FALLBACK_MODEL.to_string());
    let payload = RequestPayload::new(&model, vec![ChatMessage::user(prompt)]);
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let failed_tx = done_tx.clone();
    let callbacks = StreamCallbacks::new(
        |token| {
            print!("{token}");
            let _ = std::io::stdout().flush();
        },
        move |_| {
            let _ = done_tx.send(Ok(()));
        },
        move |err| {
            let _ = failed_tx.send(Err(err));
        },
    );

    let cancel = provider.stream_request(payload, callbacks);
    tokio::select! {
        outcome = done_rx.recv() => {
            println!();
            outcome.context("stream ended without a result")??;
        }
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            println!();
        }
    }
    Ok(())
}
