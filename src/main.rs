use std::path::PathBuf;

use channel_pager::app::RunOptions;

const USAGE: &str = "Channel Pager - page through an archived channel.\n\nUsage: channel-pager [--config PATH] <channel-id> [query]\n\n  query                e.g. 'sort_order=asc&items_per_chunk=20&chunk=2'\n  --config PATH        Read configuration from PATH\n  --version, -V        Show version and exit\n  --help,    -h        Show this help message";

#[tokio::main(flavor = "current_thread")]
async fn main() {
    ::env_logger::init();

    let options = match parse_args(std::env::args().skip(1)) {
        Ok(Some(options)) => options,
        Ok(None) => return,
        Err(err) => {
            eprintln!("error: {err}\n\n{USAGE}");
            std::process::exit(2);
        }
    };

    if let Err(err) = channel_pager::run(options).await {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

/// `Ok(None)` when a flag was handled and the process should exit.
fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Option<RunOptions>> {
    let mut options = RunOptions::default();
    let mut positional = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("Channel Pager {}", channel_pager::VERSION);
                return Ok(None);
            }
            "--help" | "-h" => {
                println!("{USAGE}");
                return Ok(None);
            }
            "--config" => {
                let path = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--config needs a path"))?;
                options.config_file = Some(PathBuf::from(path));
            }
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    options.channel_id = positional
        .next()
        .ok_or_else(|| anyhow::anyhow!("missing channel id"))?;
    options.query = positional.next();
    anyhow::ensure!(positional.next().is_none(), "unexpected extra arguments");
    Ok(Some(options))
}
