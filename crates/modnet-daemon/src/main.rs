//! modnet module daemon.
//!
//! Starts one module, logs the modules and applications it discovers and
//! stops cleanly on ctrl-c.
//!
//!   modnet --listen 0.0.0.0:5000 --name kitchen
//!   modnet --config module.toml show-config

mod cli;

use clap::Parser;
use cli::{Cli, Command};
use modnet_core::{ApplicationInfo, ModuleId, ModuleInfo, ServerState};
use modnet_server::{
    ApplicationDirectory, ApplicationDirectoryListener, ModuleDirectory, ModuleDirectoryListener,
    ServerConfig, ServerManager, ServerStateListener, Services, TcpUdpTransport,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match &cli.log {
        Some(directives) => EnvFilter::try_new(directives)?,
        None => EnvFilter::from_default_env().add_directive("modnet=info".parse()?),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = cli.server_config()?;
    match cli.command.unwrap_or(Command::Run) {
        Command::ShowConfig => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Command::Run => run(config).await,
    }
}

async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let manager = ServerManager::new(TcpUdpTransport::default());
    let modules = ModuleDirectory::new();
    let applications = ApplicationDirectory::new();

    manager.add_listener(Arc::new(StateLog));
    manager.add_listener(modules.clone());
    manager.add_listener(applications.clone());
    modules.add_listener(Arc::new(ModuleLog {
        applications: applications.clone(),
    }));
    applications.add_listener(Arc::new(ApplicationLog));

    tracing::info!(module = %config.module_id, name = ?config.name, "starting");
    let Some(start) = manager.start_server(config) else {
        anyhow::bail!("server is already running");
    };
    start.await??;

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupted, shutting down");
    if let Some(stop) = manager.shutdown_server() {
        stop.await??;
    }
    Ok(())
}

struct StateLog;

impl ServerStateListener for StateLog {
    fn state_changed(&self, state: ServerState, services: Option<&Services>) {
        match services {
            Some(services) => tracing::info!(
                %state,
                listen = ?services.connections.listening_addresses(),
                groups = ?services.beacon.groups(),
                "server"
            ),
            None => tracing::info!(%state, "server"),
        }
    }
}

struct ModuleLog {
    applications: Arc<ApplicationDirectory>,
}

impl ModuleDirectoryListener for ModuleLog {
    fn module_added(&self, info: &ModuleInfo) {
        tracing::info!(module = %info.module_id, "module connected");
    }

    fn module_updated(&self, info: &ModuleInfo) {
        tracing::info!(
            module = %info.module_id,
            name = info.name.as_deref().unwrap_or("-"),
            location = info.location.as_deref().unwrap_or("-"),
            "module identified"
        );
        let applications = self.applications.clone();
        tokio::spawn(async move {
            applications.update().await;
        });
    }

    fn module_removed(&self, module: ModuleId) {
        tracing::info!(%module, "module disconnected");
    }
}

struct ApplicationLog;

impl ApplicationDirectoryListener for ApplicationLog {
    fn applications_resolved(&self, applications: &[ApplicationInfo]) {
        for app in applications {
            tracing::info!(
                application = %app.id,
                name = %app.name,
                modules = app.modules().count(),
                "application"
            );
        }
    }
}
