//! Serves per-pull-request previews of a static site.
//!
//! GitHub webhooks drive a [`registry::InstanceRegistry`] of
//! [`instance::PreviewInstance`]s, each of which downloads its PR branch,
//! runs a site server for it on a port from a shared
//! [`port_alloc::PortAllocator`] and reports back on the pull request.

use std::sync::{Arc, Mutex};

use anyhow::Context;

pub mod archive;
pub mod commands;
pub mod comments;
pub mod config;
pub mod dispatch;
pub mod github;
pub mod http;
pub mod instance;
pub mod op_queue;
pub mod port_alloc;
pub mod registry;
pub mod signature;
pub mod site_server;
pub mod webhook;

#[cfg(test)]
mod test_support;

use crate::{
    archive::GithubArchiveFetcher,
    comments::Templates,
    config::Config,
    dispatch::Dispatcher,
    github::GithubClient,
    instance::{InstanceEnv, InstanceSettings},
    port_alloc::PortAllocator,
    registry::InstanceRegistry,
    site_server::CommandLauncher,
};

/// Wires the production collaborators together and returns the HTTP app.
pub fn build_app(config: &Config) -> anyhow::Result<axum::Router> {
    let ports = PortAllocator::new(config.min_port, config.max_port, config.max_bindings())
        .context("port allocator")?;
    let bind_addr = config.bind_address()?;
    let github = GithubClient::new(config.github_token.clone())?;
    let fetcher = GithubArchiveFetcher::new(github.http());
    let launcher = CommandLauncher::new(&config.server_command)?;

    tracing::info!(
        min_port = config.min_port,
        max_port = config.max_port,
        max_concurrent = ?config.max_bindings(),
        %bind_addr,
        site_root = %config.site_root.display(),
        "preview host configured"
    );

    let env = InstanceEnv {
        ports: Arc::new(Mutex::new(ports)),
        fetcher: Arc::new(fetcher),
        launcher: Arc::new(launcher),
        github: Arc::new(github),
        templates: Templates::new(
            config.link_domain.clone(),
            config.instance_open_hours,
            config.maintainer_login.clone(),
        ),
        settings: InstanceSettings {
            site_root: config.site_root.clone(),
            site_subdir: config.site_subdir.clone(),
            port_base: config.min_port,
            stale_after: config.stale_after(),
            bind_addr,
        },
    };
    let registry = InstanceRegistry::new(env);
    let dispatcher = Dispatcher::new(registry, config.bot_name.clone());

    Ok(http::router(http::AppState {
        dispatcher: Arc::new(dispatcher),
        webhook_secret: Arc::from(config.webhook_secret.as_str()),
        pr_idle_wait: config.pr_idle_wait(),
    }))
}
