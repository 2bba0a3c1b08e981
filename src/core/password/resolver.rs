use super::store::PasswordStore;

/// Something a candidate password can be tried against
pub trait PasswordProbe {
    /// True when `candidate` decodes a sample item
    fn test_password(&mut self, candidate: &str) -> bool;

    /// Whether the most recent attempt asked for a password at all
    fn password_requested(&self) -> bool;
}

/// The interactive half of resolution
pub trait PasswordPrompt {
    /// `None` or an empty string means the user gave up
    fn prompt_password(&mut self, attempt: u32) -> Option<String>;

    /// Asked after a typed password failed
    fn confirm_retry(&mut self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionState {
    TryingCached,
    Prompting,
    Resolved,
    GivenUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(String),
    GivenUp,
}

impl Resolution {
    pub fn password(&self) -> Option<&str> {
        match self {
            Resolution::Resolved(password) => Some(password),
            Resolution::GivenUp => None,
        }
    }
}

/// Finds a working password: cached candidates first, then the user
pub struct PasswordResolver {
    state: ResolutionState,
    max_prompts: Option<u32>,
    requested: bool,
    attempts: u32,
}

impl PasswordResolver {
    pub fn new() -> Self {
        Self {
            state: ResolutionState::TryingCached,
            max_prompts: None,
            requested: false,
            attempts: 0,
        }
    }

    /// Stop prompting after `max` typed passwords
    pub fn with_max_prompts(mut self, max: Option<u32>) -> Self {
        self.max_prompts = max;
        self
    }

    pub fn state(&self) -> ResolutionState {
        self.state
    }

    /// Candidates tried so far, typed ones included
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Run the machine to completion
    ///
    /// # Arguments
    /// * `probe` - Session the candidates are tested against
    /// * `store` - Source of cached candidates, tried after the empty password
    /// * `prompt` - Asked for more passwords once the cache is exhausted
    ///
    /// # Returns
    /// * `Resolution::Resolved` - Password to extract with. When no attempt
    ///   ever asked for a password this is `""`, and extraction reports the
    ///   real failure.
    /// * `Resolution::GivenUp` - The user stopped, or the prompt limit ran out
    pub fn resolve(
        &mut self,
        probe: &mut dyn PasswordProbe,
        store: &PasswordStore,
        prompt: &mut dyn PasswordPrompt,
    ) -> Resolution {
        self.state = ResolutionState::TryingCached;
        self.requested = false;
        self.attempts = 0;

        let candidates = std::iter::once(String::new()).chain(store.all_passwords());
        for candidate in candidates {
            if self.attempt(probe, &candidate) {
                tracing::info!(cached = !candidate.is_empty(), "password resolved from cache");
                return self.finish(Resolution::Resolved(candidate));
            }
        }

        if !self.requested {
            tracing::debug!("no password was ever requested, leaving failure to extraction");
            return self.finish(Resolution::Resolved(String::new()));
        }

        self.state = ResolutionState::Prompting;
        let mut prompts = 0u32;
        loop {
            if self.max_prompts.map_or(false, |max| prompts >= max) {
                tracing::info!(prompts, "password prompt limit reached");
                return self.finish(Resolution::GivenUp);
            }
            prompts += 1;

            let typed = match prompt.prompt_password(prompts) {
                Some(typed) if !typed.is_empty() => typed,
                _ => {
                    tracing::info!("password prompt dismissed");
                    return self.finish(Resolution::GivenUp);
                }
            };

            if self.attempt(probe, &typed) {
                tracing::info!(prompts, "typed password accepted");
                return self.finish(Resolution::Resolved(typed));
            }
            if !prompt.confirm_retry() {
                return self.finish(Resolution::GivenUp);
            }
        }
    }

    fn attempt(&mut self, probe: &mut dyn PasswordProbe, candidate: &str) -> bool {
        self.attempts += 1;
        let accepted = probe.test_password(candidate);
        self.requested |= probe.password_requested();
        accepted
    }

    fn finish(&mut self, resolution: Resolution) -> Resolution {
        self.state = match resolution {
            Resolution::Resolved(_) => ResolutionState::Resolved,
            Resolution::GivenUp => ResolutionState::GivenUp,
        };
        resolution
    }
}

impl Default for PasswordResolver {
    fn default() -> Self {
        Self::new()
    }
}
