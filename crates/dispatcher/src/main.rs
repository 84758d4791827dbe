use anyhow::Context;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    brushwork_observability::init();

    let settings = brushwork_dispatcher::Settings::from_env().context("invalid settings")?;
    let config = brushwork_outbox::DispatcherConfig::from_env().context("invalid dispatcher config")?;

    brushwork_dispatcher::run(settings, config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
    })
    .await
}
