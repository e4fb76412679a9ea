//! Interactive console session.
//!
//! Plain lines are delivered as basic messages from the other party. Lines
//! starting with `/` are console commands.

use colored::Colorize;
use didbot_agency::MultiplexerHandle;
use didbot_core::notification::{
    BackendData, HookData, Notification, ProofValue, ProtocolStatus, Question,
};
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::mpsc;

const HELP_TEXT: &str = r#"
Anything not starting with '/' is sent to the bot as a basic message.

Available commands:
  /help                           Show this help
  /prove <name=value>...          Present proof values to the bot
  /hook <key=value>...            Deliver user hook data
  /backend <subject> <text>       Send a backend message
  /conversations                  List live conversations
  /stats                          Show multiplexer counters
  /quit, /exit                    Exit the console
"#;

/// One parsed console line.
#[derive(Debug, PartialEq)]
enum Input {
    Deliver(Notification),
    Hook(HookData),
    Conversations,
    Stats,
    Help,
    Quit,
}

pub async fn run(
    conn_id: String,
    inbound: mpsc::Sender<Notification>,
    handle: MultiplexerHandle,
    history_file: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    let history_path = history_file.unwrap_or_else(|| {
        home::home_dir()
            .map(|h| h.join(".didbot_history"))
            .unwrap_or_else(|| ".didbot_history".into())
    });
    let _ = rl.load_history(&history_path);

    println!("Talking as connection {}. Type '/help' for commands.\n", conn_id.yellow());

    loop {
        let prompt = format!("{} ", "you>".cyan());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match parse_line(&conn_id, line) {
                    Ok(Input::Deliver(notification)) => {
                        if inbound.send(notification).await.is_err() {
                            println!("{}", "Multiplexer stopped.".red());
                            break;
                        }
                    }
                    Ok(Input::Hook(data)) => {
                        if let Err(e) = handle.hook(data).await {
                            println!("{}: {}", "Error".red(), e);
                        }
                    }
                    Ok(Input::Conversations) => match handle.conversations().await {
                        Ok(list) if list.is_empty() => println!("{}", "(none)".dimmed()),
                        Ok(list) => {
                            for info in list {
                                println!("{}  started {}", info.conn_id.yellow(), info.started_at);
                            }
                        }
                        Err(e) => println!("{}: {}", "Error".red(), e),
                    },
                    Ok(Input::Stats) => {
                        let stats = serde_json::to_value(handle.stats())?;
                        println!("{}", format_json(&stats));
                    }
                    Ok(Input::Help) => println!("{}", HELP_TEXT),
                    Ok(Input::Quit) => break,
                    Err(e) => println!("{}: {}", "Error".red(), e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                println!("{}: {:?}", "Error".red(), err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);
    Ok(())
}

fn parse_line(conn_id: &str, line: &str) -> Result<Input, String> {
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Input::Deliver(Notification::Status(
            ProtocolStatus::basic_message(conn_id, line),
        )));
    };

    let parts: Vec<&str> = command.split_whitespace().collect();
    let Some((cmd, args)) = parts.split_first() else {
        return Err("empty command".to_string());
    };

    match cmd.to_lowercase().as_str() {
        "help" | "?" => Ok(Input::Help),
        "quit" | "exit" => Ok(Input::Quit),
        "stats" => Ok(Input::Stats),
        "conversations" | "convs" => Ok(Input::Conversations),
        "prove" => {
            let values = pairs(args)?
                .into_iter()
                .map(|(name, value)| ProofValue {
                    name,
                    value,
                    cred_def_id: None,
                })
                .collect::<Vec<_>>();
            if values.is_empty() {
                return Err("usage: /prove <name=value>...".to_string());
            }
            Ok(Input::Deliver(Notification::Question(Question::proof_verify(
                conn_id, values,
            ))))
        }
        "hook" => Ok(Input::Hook(HookData {
            conn_id: conn_id.to_string(),
            data: pairs(args)?,
        })),
        "backend" => {
            let Some((subject, words)) = args.split_first() else {
                return Err("usage: /backend <subject> <text>".to_string());
            };
            Ok(Input::Deliver(Notification::Backend(BackendData {
                conn_id: conn_id.to_string(),
                protocol: String::new(),
                subject: subject.to_string(),
                content: words.join(" "),
            })))
        }
        other => Err(format!("unknown command '/{}', try /help", other)),
    }
}

fn pairs(args: &[&str]) -> Result<BTreeMap<String, String>, String> {
    args.iter()
        .map(|arg| {
            arg.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| format!("expected key=value, got '{}'", arg))
        })
        .collect()
}

fn format_json(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
