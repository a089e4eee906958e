use clap::Parser;

fn main() -> Result<(), anyhow::Error> {
    let args = f_stop::Args::parse();

    // Use reasonable defaults for printing structured logs to stderr.
    let builder = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_ansi(!matches!(std::env::var("NO_COLOR"), Ok(v) if v == "1"));

    if args.log_json {
        tracing::subscriber::set_global_default(builder.json().finish())
            .expect("setting tracing default failed");
    } else {
        tracing::subscriber::set_global_default(builder.finish())
            .expect("setting tracing default failed");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(runtime.spawn(async move { f_stop::run(args).await }));

    tracing::info!(?result, "main function completed, shutting down runtime");
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    result?
}
