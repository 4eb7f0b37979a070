use std::sync::Arc;

use preview_instance::PrDetails;

use crate::{
    commands::{Command, parse_command},
    comments::Templates,
    github::GithubApi,
    registry::InstanceRegistry,
    webhook::{CommentEvent, PrAction, PreviewEvent, PullRequestEvent},
};

/// Turns parsed webhook events into instance operations and command replies.
pub struct Dispatcher {
    registry: Arc<InstanceRegistry>,
    github: Arc<dyn GithubApi>,
    templates: Templates,
    bot_name: String,
}

impl Dispatcher {
    pub fn new(registry: Arc<InstanceRegistry>, bot_name: impl Into<String>) -> Self {
        let env = registry.env();
        Self {
            github: Arc::clone(&env.github),
            templates: env.templates.clone(),
            registry,
            bot_name: bot_name.into(),
        }
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub async fn dispatch(&self, event: PreviewEvent) {
        match event {
            PreviewEvent::PullRequest(ev) => self.on_pull_request(ev),
            PreviewEvent::Comment(ev) => self.on_comment(ev).await,
        }
    }

    fn on_pull_request(&self, ev: PullRequestEvent) {
        let PullRequestEvent {
            action,
            details,
            sender,
        } = ev;
        tracing::info!(pr = %details.number, ?action, %sender, "pull request event");
        match action {
            PrAction::Opened | PrAction::Reopened => {
                self.registry.with_instance(&details, |i| i.download());
            }
            PrAction::Synchronize => {
                self.registry
                    .with_instance(&details, |i| i.rebuild(Some(details.clone())));
            }
            PrAction::Closed => {
                self.registry.with_instance(&details, |i| i.destroy(true));
            }
        }
    }

    async fn on_comment(&self, ev: CommentEvent) {
        let Some(command) = parse_command(&ev.body, &self.bot_name) else {
            return;
        };
        let is_author = ev.commenter.eq_ignore_ascii_case(&ev.pr_author);
        tracing::info!(pr = %ev.number, command = command.keyword(), commenter = %ev.commenter, "bot command");

        if command.requires_author() && !is_author {
            let body = self.templates.author_only(&ev.commenter, command.keyword());
            self.reply(&ev, &body).await;
            return;
        }

        match command {
            Command::List => {
                let body = self.templates.command_list(&self.bot_name, is_author);
                self.reply(&ev, &body).await;
            }
            Command::Status => {
                let port = self.registry.get(ev.number).and_then(|i| i.port());
                self.reply(&ev, &self.templates.status(port)).await;
            }
            Command::Create => {
                let known = self.registry.get(ev.number);
                if let Some(port) = known.as_ref().and_then(|i| i.port()) {
                    self.reply(&ev, &self.templates.already_running(port)).await;
                    return;
                }
                let details = match known {
                    Some(instance) => instance.details(),
                    None => match self.fetch_details(&ev).await {
                        Some(details) => details,
                        None => return,
                    },
                };
                self.registry.with_instance(&details, |i| i.relight());
            }
            Command::Recreate => {
                let Some(details) = self.fetch_details(&ev).await else {
                    return;
                };
                self.registry
                    .with_instance(&details, |i| i.rebuild(Some(details.clone())));
            }
            Command::Destroy => {
                let Some(instance) = self.registry.get(ev.number) else {
                    self.reply(&ev, &self.templates.status(None)).await;
                    return;
                };
                instance.destroy(false);
                instance.current_run().await;
                self.reply(&ev, &self.templates.destroyed()).await;
            }
        }
    }

    async fn fetch_details(&self, ev: &CommentEvent) -> Option<PrDetails> {
        match self
            .github
            .pull_request(&ev.owner, &ev.repo, ev.number)
            .await
        {
            Ok(meta) => Some(meta.into_details(&ev.owner, &ev.repo, ev.number)),
            Err(err) => {
                tracing::warn!(pr = %ev.number, error = %format!("{err:#}"), "pull request lookup failed");
                None
            }
        }
    }

    async fn reply(&self, ev: &CommentEvent, body: &str) {
        if let Err(err) = self
            .github
            .post_comment(&ev.owner, &ev.repo, ev.number, body)
            .await
        {
            tracing::warn!(pr = %ev.number, error = %format!("{err:#}"), "posting reply failed");
        }
    }
}
