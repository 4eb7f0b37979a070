/// Renders the comments the host posts on pull requests.
#[derive(Debug, Clone)]
pub struct Templates {
    link_domain: String,
    open_hours: u64,
    // Comments to this login skip the "thanks for contributing" line.
    maintainer_login: Option<String>,
}

impl Templates {
    pub fn new(link_domain: impl Into<String>, open_hours: u64, maintainer_login: Option<String>) -> Self {
        Self {
            link_domain: link_domain.into(),
            open_hours,
            maintainer_login,
        }
    }

    pub fn link(&self, port: u16) -> String {
        format!("http://{}:{port}", self.link_domain)
    }

    pub fn new_preview(&self, author: &str, port: u16) -> String {
        let thanks = if self.is_maintainer(author) {
            ""
        } else {
            "Thanks for contributing!"
        };
        fancify(&format!(
            "Hey there, @{author}!
            I've spun up a server so you can preview the wiki with your changes. It has all the same styling as the real wiki, so your changes here will look the exact same when merged.
            ## → [Click Here]({link} \"Click to go to preview site\") ← to go to the preview site.
            (Other contributors and reviewers may use this to make sure your changes are top-notch)
            <br>
            My resources are limited, so I can only keep the preview open for {hours} hours. Every time I see more changes show up in this thread I'll restart the timer and plug your latest changes into the preview.
            {thanks}",
            link = self.link(port),
            hours = self.open_hours,
        ))
        .trim_end()
        .to_string()
    }

    pub fn updated(&self, port: u16) -> String {
        fancify(&format!(
            "I've plugged your latest changes into the preview, so I'll keep the site open for another {hours} hours.
            [Click Here]({link} \"Click to go to preview site\") to go to the preview site",
            link = self.link(port),
            hours = self.open_hours,
        ))
    }

    pub fn no_resources(&self, author: &str) -> String {
        fancify(&format!(
            "Hey there, @{author}! I'd love to spin up a preview of your changes, but I'm out of resources right now.
            Ask me again later with a `create` command, or push another commit and I'll retry."
        ))
    }

    pub fn destroyed(&self) -> String {
        "I've shut down the preview for this PR and removed its files.".to_string()
    }

    pub fn already_running(&self, port: u16) -> String {
        format!(
            "A preview is already running: [Click Here]({} \"Click to go to preview site\")",
            self.link(port)
        )
    }

    pub fn status(&self, port: Option<u16>) -> String {
        match port {
            Some(port) => format!("The preview is running at {}", self.link(port)),
            None => "No preview is running for this PR right now.".to_string(),
        }
    }

    pub fn command_list(&self, bot_name: &str, commenter_is_author: bool) -> String {
        let notice = if commenter_is_author {
            String::new()
        } else {
            "Only the author of this PR can run `create`, `recreate` and `destroy` here.\n".to_string()
        };
        fancify(&format!(
            "{notice}Commands (comment `@{bot_name} <command>`):
            - `list`: show this list
            - `status`: check whether the preview is running
            - `create`: start the preview if it is not running
            - `recreate`: download the branch again and restart the preview
            - `destroy`: shut the preview down"
        ))
    }

    pub fn author_only(&self, commenter: &str, keyword: &str) -> String {
        format!("Sorry @{commenter}, only the author of this PR can use `{keyword}`.")
    }

    fn is_maintainer(&self, login: &str) -> bool {
        self.maintainer_login
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case(login))
    }
}

/// Strips leading indentation from every line so markdown does not render it as code.
pub fn fancify(text: &str) -> String {
    text.lines()
        .map(str::trim_start)
        .collect::<Vec<_>>()
        .join("\n")
}
