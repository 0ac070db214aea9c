/// Arguments passed to restic, kept in insertion order so invocations are reproducible.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Flags {
    entries: Vec<(String, Vec<String>)>,
}

impl Flags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `values` to `key`, adding the key at the end if it is new.
    pub fn add_flag<I, S>(&mut self, key: &str, values: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values = values.into_iter().map(Into::into);
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => existing.extend(values),
            None => self.entries.push((key.to_string(), values.collect())),
        }
        self
    }

    /// Adds a flag without a value, e.g. `--json`.
    pub fn add_switch(&mut self, key: &str) -> &mut Self {
        self.add_flag(key, std::iter::empty::<String>())
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.add_flag(key, [value.into()]);
        self
    }

    pub fn with_switch(mut self, key: &str) -> Self {
        self.add_switch(key);
        self
    }

    /// Flags of both, values of shared keys are concatenated.
    pub fn combine(first: &Flags, second: &Flags) -> Flags {
        let mut combined = first.clone();
        for (key, values) in &second.entries {
            combined.add_flag(key, values.iter().cloned());
        }
        combined
    }

    /// `[command, flags..., args...]`
    pub fn apply_to_command<I, S>(&self, command: &str, args: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out = Vec::new();
        if !command.is_empty() {
            out.push(command.to_string());
        }
        for (flag, values) in &self.entries {
            if values.is_empty() {
                out.push(flag.clone());
            }
            for value in values {
                out.push(flag.clone());
                out.push(value.clone());
            }
        }
        out.extend(args.into_iter().map(Into::into));
        out
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Expands tags to `--tag T` pairs.
pub fn tag_args(tags: &[String]) -> Vec<String> {
    tags.iter()
        .flat_map(|t| ["--tag".to_string(), t.clone()])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_to_command() {
        let flags = Flags::new()
            .with("--host", "ns")
            .with_switch("--json")
            .with("--option", "a=1");
        assert_eq!(
            flags.apply_to_command("backup", ["/data/pvc"]),
            vec!["backup", "--host", "ns", "--json", "--option", "a=1", "/data/pvc"]
        );
    }

    #[test]
    fn test_empty_command_is_skipped() {
        let flags = Flags::new().with_switch("--no-lock");
        assert_eq!(
            flags.apply_to_command("", Vec::<String>::new()),
            vec!["--no-lock"]
        );
    }

    #[test]
    fn test_combine_appends_shared_keys() {
        let mut global = Flags::new();
        global.add_flag("--option", ["a=1"]);
        let local = Flags::new().with("--option", "b=2").with_switch("--json");

        let combined = Flags::combine(&global, &local);
        assert_eq!(
            combined.apply_to_command("check", Vec::<String>::new()),
            vec!["check", "--option", "a=1", "--option", "b=2", "--json"]
        );
        // inputs are untouched
        assert_eq!(
            global.apply_to_command("", Vec::<String>::new()),
            vec!["--option", "a=1"]
        );
    }

    #[test]
    fn test_tag_args() {
        let tags = vec!["daily".to_string(), "db".to_string()];
        assert_eq!(tag_args(&tags), vec!["--tag", "daily", "--tag", "db"]);
        assert!(tag_args(&[]).is_empty());
    }
}
