use std::io::Write;

use anyhow::Result;
use bat::PrettyPrinter;
use clap::Parser;
use cliclack::{input, spinner};
use console::style;
use tracing_subscriber::EnvFilter;

use simplemind::providers::factory::ProviderType;
use simplemind::{Role, Settings, Simplemind};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Provider to chat with (falls back to DEFAULT_LLM_PROVIDER)
    #[arg(short, long)]
    provider: Option<String>,

    /// Model to use (defaults to the provider's default model)
    #[arg(short, long)]
    model: Option<String>,

    /// API key for the chosen provider (can also be set via <PROVIDER>_API_KEY)
    #[arg(short, long)]
    api_key: Option<String>,

    /// Stream each reply as it is generated. Streamed prompts are single-shot:
    /// they carry no history and bypass conversation plugins
    #[arg(short, long)]
    stream: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut settings = Settings::from_env();
    let provider_name = cli
        .provider
        .clone()
        .or_else(|| settings.default_llm_provider.clone())
        .unwrap_or_else(|| ProviderType::OpenAi.name().to_string());
    if let Some(api_key) = cli.api_key {
        let provider = ProviderType::from_name(&provider_name)?;
        settings = settings.with_api_key(provider.name(), api_key);
    }
    let client = Simplemind::new(settings);
    let mut conversation =
        client.create_conversation(cli.model.as_deref(), Some(&provider_name));

    println!(
        "simplemind chat with {} {}",
        style(&provider_name).bold(),
        style("- type \"exit\" to end the session").dim()
    );
    println!("\n");

    loop {
        let message_text: String = input("Message:").placeholder("").multiline().interact()?;

        if message_text.trim().eq_ignore_ascii_case("exit") {
            break;
        }

        if cli.stream {
            let chunks = client.generate_stream_text(
                &message_text,
                cli.model.as_deref(),
                Some(&provider_name),
            )?;
            let mut stdout = std::io::stdout();
            for chunk in chunks {
                write!(stdout, "{}", chunk?)?;
                stdout.flush()?;
            }
            println!("\n");
            continue;
        }

        conversation.add_message(Role::User, message_text, None);

        let spin = spinner();
        spin.start("awaiting reply");
        let reply = conversation.send(None, None);
        spin.stop("");

        match reply? {
            Some(message) => render(&message.text)?,
            None => println!("{}", style("(skipped)").dim()),
        }
        println!("\n");
    }
    Ok(())
}

fn render(content: &str) -> Result<()> {
    PrettyPrinter::new()
        .input_from_bytes(content.as_bytes())
        .language("markdown")
        .print()
        .map_err(|e| anyhow::anyhow!("Failed to render reply: {}", e))?;
    Ok(())
}
