/// How sibling groups sharing a call site are told apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum KeyPolicy {
    /// Siblings from the same call site match by position. Reordering them
    /// moves remembered state between items.
    #[default]
    Positional,
    /// A repeated call site without an explicit key is a contract violation.
    RequireExplicitInLoops,
}

#[derive(Clone, Debug)]
pub struct CompositionConfig {
    /// Upper bound on passes taken by `Composition::run_until_idle`.
    pub max_settle_passes: usize,
    pub key_policy: KeyPolicy,
    /// Isolate restartable group bodies with `catch_unwind` so one failing
    /// group leaves its siblings composing. When off, panics escape to the
    /// caller of `set_content`/`recompose`.
    pub catch_panics: bool,
}

impl Default for CompositionConfig {
    fn default() -> Self {
        Self {
            max_settle_passes: 16,
            key_policy: KeyPolicy::Positional,
            catch_panics: true,
        }
    }
}

impl CompositionConfig {
    pub fn with_key_policy(mut self, key_policy: KeyPolicy) -> Self {
        self.key_policy = key_policy;
        self
    }

    pub fn with_max_settle_passes(mut self, passes: usize) -> Self {
        self.max_settle_passes = passes;
        self
    }
}
