//! Demo expert that bids a flat price and echoes questions back.

use std::sync::Arc;

use askr::{Answer, Ask, AskHandler, Bid, ExpertAgent, ExpertConfig, Question, QuestionHandler, Turn};
use async_trait::async_trait;
use clap::Parser;
use tracing::info;

/// Command line interface entry point.
#[derive(Parser)]
#[command(name = "echo_expert", author, version, about = "Echo expert over Nostr")]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Satoshis to ask per bid.
    #[arg(long, default_value_t = 10)]
    price: u64,
    /// Satoshis to ask per follow-up; 0 disables follow-ups.
    #[arg(long, default_value_t = 0)]
    followup_price: u64,
}

/// Bids `price` on every ask and repeats the question text back.
struct Echo {
    price: u64,
    followup_price: u64,
}

#[async_trait]
impl AskHandler for Echo {
    async fn on_ask(&self, ask: &Ask) -> askr::Result<Option<Bid>> {
        info!(ask = %ask.id, "bidding on: {}", ask.content);
        Ok(Some(Bid::new("I will echo your question back.", self.price)))
    }
}

#[async_trait]
impl QuestionHandler for Echo {
    async fn on_question(
        &self,
        _ask: &Ask,
        _bid: &Bid,
        question: &Question,
        history: &[Turn],
    ) -> askr::Result<Answer> {
        info!(question = %question.id, turn = history.len() + 1, "answering");
        let answer = Answer::new(format!("You said: {}", question.content));
        if self.followup_price > 0 {
            Ok(answer.with_followup(self.followup_price))
        } else {
            Ok(answer)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    let cli = Cli::parse();
    let cfg = ExpertConfig::from_env(&cli.env)?;
    let handler = Arc::new(Echo {
        price: cli.price,
        followup_price: cli.followup_price,
    });
    let agent = ExpertAgent::new(cfg, handler.clone(), handler)?;
    agent.start().await;
    tokio::signal::ctrl_c().await?;
    agent.stop().await;
    Ok(())
}
