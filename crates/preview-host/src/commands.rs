//! Commands addressed to the bot in PR comments, e.g. `@EPSWebPreview create`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    List,
    Status,
    Create,
    Recreate,
    Destroy,
}

impl Command {
    pub fn keyword(self) -> &'static str {
        match self {
            Command::List => "list",
            Command::Status => "status",
            Command::Create => "create",
            Command::Recreate => "recreate",
            Command::Destroy => "destroy",
        }
    }

    /// Commands that change the preview may only be issued by the PR author.
    pub fn requires_author(self) -> bool {
        matches!(self, Command::Create | Command::Recreate | Command::Destroy)
    }

    fn from_keyword(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "list" => Some(Command::List),
            "status" => Some(Command::Status),
            "create" => Some(Command::Create),
            "recreate" => Some(Command::Recreate),
            "destroy" => Some(Command::Destroy),
            _ => None,
        }
    }
}

/// Finds the first `@<bot_name> <keyword>` in `text`.
///
/// The mention is matched case-insensitively and must not be glued to a
/// preceding word (`foo@bot` is ignored). Unknown keywords are skipped and the
/// search continues with the next mention.
pub fn parse_command(text: &str, bot_name: &str) -> Option<Command> {
    let trigger = format!("@{bot_name}");
    let mut search_from = 0;
    while let Some(pos) = find_trigger(text, search_from, &trigger) {
        let after = &text[pos + trigger.len()..];
        if let Some(cmd) = keyword_after_trigger(after) {
            return Some(cmd);
        }
        search_from = pos + trigger.len();
    }
    None
}

fn find_trigger(text: &str, start: usize, trigger: &str) -> Option<usize> {
    let mut pos = start;
    while pos < text.len() {
        let at = pos + text[pos..].find('@')?;
        if let Some(candidate) = text.get(at..at + trigger.len())
            && candidate.eq_ignore_ascii_case(trigger)
        {
            let boundary = text[..at]
                .chars()
                .next_back()
                .is_none_or(|c| !c.is_alphanumeric());
            if boundary {
                return Some(at);
            }
        }
        pos = at + 1;
    }
    None
}

fn keyword_after_trigger(text: &str) -> Option<Command> {
    // The mention must be followed by whitespace: `@botx list` is another user.
    let text = text.strip_prefix(|c: char| c.is_whitespace())?;
    let word = text.split_whitespace().next()?;
    Command::from_keyword(word)
}
