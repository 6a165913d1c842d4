//! Command-line surface. Parameters declare their flags on a [`FlagSet`]
//! and read their values back from [`ParsedFlags`].

use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::RunConfig;
use crate::error::HarnessError;

const GLOBAL_FLAGS: &[&str] = &[
    "base-dir",
    "list",
    "symlink",
    "verbose",
    "suspend-on-error",
    "overrides",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagKind {
    Single,
    Repeated,
}

pub struct FlagSet {
    command: Command,
    flags: BTreeMap<String, FlagKind>,
    globals: bool,
}

impl FlagSet {
    /// A flag set without the run-level flags, used for nested parsing.
    pub fn new(name: &str) -> Self {
        let command = Command::new(name.to_string())
            .no_binary_name(true)
            .disable_version_flag(true);
        Self {
            command,
            flags: BTreeMap::new(),
            globals: false,
        }
    }

    /// A flag set carrying the base directory, listing, symlink,
    /// verbosity, suspend and overrides flags.
    pub fn with_globals(name: &str) -> Self {
        let mut set = Self::new(name);
        set.globals = true;
        set.command = set
            .command
            .arg(
                Arg::new("base-dir")
                    .short('d')
                    .long("base-dir")
                    .value_name("DIR")
                    .default_value(".")
                    .help("Directory which is used for storing the experiment data"),
            )
            .arg(
                Arg::new("list")
                    .short('l')
                    .long("list")
                    .action(ArgAction::SetTrue)
                    .help("List all experiment results"),
            )
            .arg(
                Arg::new("symlink")
                    .short('s')
                    .long("symlink")
                    .action(ArgAction::SetTrue)
                    .help("Symlink the result directory as the newest one"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .action(ArgAction::Count)
                    .help("Increase verbosity (specify multiple times for more)"),
            )
            .arg(
                Arg::new("suspend-on-error")
                    .long("suspend-on-error")
                    .action(ArgAction::SetTrue)
                    .help("Wait for the operator before cleaning up after a failed run"),
            )
            .arg(
                Arg::new("overrides")
                    .long("overrides")
                    .value_name("FILE")
                    .help("YAML or JSON file with parameter values"),
            );
        set
    }

    pub fn contains(&self, name: &str) -> bool {
        self.flags.contains_key(name)
    }

    /// Declares `--<name> VALUE`. Declaring the same flag twice is a no-op.
    pub fn add(&mut self, name: &str, default: Option<&str>) -> Result<()> {
        self.declare(name, FlagKind::Single, default)
    }

    /// Declares a repeatable `--<name> VALUE` flag collecting every value.
    pub fn add_repeated(&mut self, name: &str) -> Result<()> {
        self.declare(name, FlagKind::Repeated, None)
    }

    fn declare(&mut self, name: &str, kind: FlagKind, default: Option<&str>) -> Result<()> {
        if self.globals && GLOBAL_FLAGS.contains(&name) {
            return Err(HarnessError::DuplicateName(name.to_string()).into());
        }
        match self.flags.get(name) {
            Some(existing) if *existing == kind => return Ok(()),
            Some(_) => return Err(HarnessError::DuplicateName(name.to_string()).into()),
            None => {}
        }
        let mut arg = Arg::new(name.to_string())
            .long(name.to_string())
            .value_name("VALUE")
            .allow_hyphen_values(true);
        arg = match kind {
            FlagKind::Single => arg.action(ArgAction::Set),
            FlagKind::Repeated => arg.action(ArgAction::Append),
        };
        arg = match (kind, default) {
            (FlagKind::Repeated, _) => arg.help("Repeatable list parameter"),
            (FlagKind::Single, Some(d)) => arg.help(format!("(default: {})", d)),
            (FlagKind::Single, None) => arg.help("(optional)"),
        };
        let command = std::mem::replace(&mut self.command, Command::new("placeholder"));
        self.command = command.arg(arg);
        self.flags.insert(name.to_string(), kind);
        Ok(())
    }

    pub fn render_help(&self) -> String {
        self.command.clone().render_help().to_string()
    }

    pub fn parse<I, S>(&self, args: I) -> std::result::Result<ParsedFlags, clap::Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let matches = self.command.clone().try_get_matches_from(args)?;
        let mut values = BTreeMap::new();
        for name in self.flags.keys() {
            if let Some(given) = matches.get_many::<String>(name.as_str()) {
                values.insert(name.clone(), given.cloned().collect::<Vec<_>>());
            }
        }
        let config = if self.globals {
            config_from_matches(&matches)
        } else {
            RunConfig::default()
        };
        Ok(ParsedFlags {
            values,
            known: self.flags.keys().cloned().collect(),
            config,
        })
    }
}

fn config_from_matches(matches: &ArgMatches) -> RunConfig {
    RunConfig {
        base_dir: matches
            .get_one::<String>("base-dir")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".")),
        list: matches.get_flag("list"),
        symlink: matches.get_flag("symlink"),
        verbosity: matches.get_count("verbose"),
        suspend_on_error: matches.get_flag("suspend-on-error"),
        overrides: matches.get_one::<String>("overrides").map(PathBuf::from),
    }
}

/// Values extracted from a command line, after keyword overrides.
#[derive(Debug, Clone, Default)]
pub struct ParsedFlags {
    values: BTreeMap<String, Vec<String>>,
    known: Vec<String>,
    pub config: RunConfig,
}

impl ParsedFlags {
    /// Last value given for a flag.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.values
            .get(name)
            .and_then(|v| v.last())
            .map(|s| s.as_str())
    }

    pub fn values(&self, name: &str) -> &[String] {
        self.values.get(name).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn was_given(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Overrides a declared flag as if it had been given on the command line.
    pub fn set(&mut self, name: &str, values: Vec<String>) -> Result<()> {
        if !self.known.iter().any(|k| k == name) {
            return Err(HarnessError::UnknownArgument(name.to_string()).into());
        }
        self.values.insert(name.to_string(), values);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_declared_flags_and_globals() {
        let mut set = FlagSet::with_globals("Test");
        set.add("key", Some("ABC")).expect("key");
        set.add_repeated("items").expect("items");
        let parsed = set
            .parse(["--key", "X", "--items", "a", "--items", "b", "-vv", "-d", "/tmp/out"])
            .expect("parse");
        assert_eq!(parsed.value("key"), Some("X"));
        assert_eq!(parsed.values("items"), ["a".to_string(), "b".to_string()]);
        assert_eq!(parsed.config.verbosity, 2);
        assert_eq!(parsed.config.base_dir, PathBuf::from("/tmp/out"));
        assert!(!parsed.config.list);
    }

    #[test]
    fn absent_flags_are_not_given() {
        let mut set = FlagSet::with_globals("Test");
        set.add("key", Some("ABC")).expect("key");
        let parsed = set.parse(Vec::<String>::new()).expect("parse");
        assert!(!parsed.was_given("key"));
        assert_eq!(parsed.value("key"), None);
        assert_eq!(parsed.config.base_dir, PathBuf::from("."));
    }

    #[test]
    fn declaring_twice_is_idempotent_but_kinds_must_agree() {
        let mut set = FlagSet::new("Test");
        set.add("key", None).expect("first");
        set.add("key", None).expect("second");
        assert!(set.add_repeated("key").is_err());
    }

    #[test]
    fn global_names_are_reserved() {
        let mut set = FlagSet::with_globals("Test");
        let err = set.add("list", None).expect_err("reserved");
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::DuplicateName(_))
        ));
    }

    #[test]
    fn overrides_must_name_known_flags() {
        let mut set = FlagSet::new("Test");
        set.add("key", None).expect("key");
        let mut parsed = set.parse(Vec::<String>::new()).expect("parse");
        parsed.set("key", vec!["v".to_string()]).expect("known");
        assert_eq!(parsed.value("key"), Some("v"));
        let err = parsed.set("nope", vec![]).expect_err("unknown");
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::UnknownArgument(_))
        ));
    }

    #[test]
    fn unknown_command_line_flags_are_rejected() {
        let set = FlagSet::with_globals("Test");
        assert!(set.parse(["--nope", "x"]).is_err());
    }
}
