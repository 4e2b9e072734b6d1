use clap::Parser;

mod commands;

#[derive(Parser)]
#[command(
    name = "combinetool",
    about = "Queue combine jobs and run them here or submit them to a batch system",
    version
)]
struct Cli {
    #[command(flatten)]
    run: commands::run::RunArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("combinetool=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    commands::run::run(cli.run).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
