// Copyright (c) The disttrial Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration support for disttrial.
//!
//! The default config shipped with disttrial is layered under an optional user config file.
//! Settings are grouped into profiles under `[profile.<name>]`. Custom profiles inherit any key
//! they don't set from the `default` profile.

use crate::errors::{ConfigParseError, ConfigParseErrorKind, JobsParseError, ProfileNotFound};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, ConfigBuilder, ConfigError, File, FileFormat, builder::DefaultState};
use serde::Deserialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    num::NonZeroUsize,
    str::FromStr,
};

/// Overall configuration for disttrial.
///
/// Most settings are read through a [`DistTrialProfile`], obtained with [`Self::profile`].
#[derive(Clone, Debug)]
pub struct DistTrialConfig {
    config_file: Utf8PathBuf,
    inner: ConfigImpl,
    unknown_keys: BTreeSet<String>,
}

impl DistTrialConfig {
    /// The default location of the config within a directory.
    pub const CONFIG_PATH: &'static str = ".config/disttrial.toml";

    /// The default config, as a TOML file.
    ///
    /// User configuration is layered on top of the default config.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../default-config.toml");

    /// The name of the default profile.
    pub const DEFAULT_PROFILE: &'static str = "default";

    /// Reads the config from `config_file`, or if not specified from `.config/disttrial.toml`
    /// under `root`.
    ///
    /// An explicitly specified file must exist. If it isn't specified and the default file doesn't
    /// exist, the default config is used.
    pub fn from_sources(
        root: &Utf8Path,
        config_file: Option<&Utf8Path>,
    ) -> Result<Self, ConfigParseError> {
        let (config_file, source) = match config_file {
            Some(file) => (file.to_owned(), File::new(file.as_str(), FileFormat::Toml)),
            None => {
                let config_file = root.join(Self::CONFIG_PATH);
                let source = File::new(config_file.as_str(), FileFormat::Toml).required(false);
                (config_file, source)
            }
        };

        let builder = Self::make_default_config().add_source(source);
        let (inner, unknown_keys) = Self::build_and_deserialize_config(&builder)
            .map_err(|kind| ConfigParseError::new(&config_file, kind))?;

        Ok(Self {
            config_file,
            inner,
            unknown_keys,
        })
    }

    /// Returns the path of the user config file, whether or not it exists.
    pub fn config_file(&self) -> &Utf8Path {
        &self.config_file
    }

    /// Returns the keys in the config that disttrial doesn't know about.
    pub fn unknown_keys(&self) -> &BTreeSet<String> {
        &self.unknown_keys
    }

    /// Returns the profile with the given name, or an error if it isn't defined.
    pub fn profile(&self, name: impl AsRef<str>) -> Result<DistTrialProfile<'_>, ProfileNotFound> {
        let name = name.as_ref();
        let custom_profile = self.inner.profiles.get(name)?;
        Ok(DistTrialProfile {
            name: name.to_owned(),
            default_profile: &self.inner.profiles.default,
            custom_profile,
        })
    }

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    /// This returns a tuple of (config, ignored paths).
    fn build_and_deserialize_config(
        builder: &ConfigBuilder<DefaultState>,
    ) -> Result<(ConfigImpl, BTreeSet<String>), ConfigParseErrorKind> {
        let config = builder
            .build_cloned()
            .map_err(|error| ConfigParseErrorKind::BuildError(Box::new(error)))?;

        let mut ignored = BTreeSet::new();
        let mut cb = |path: serde_ignored::Path| {
            ignored.insert(path.to_string());
        };
        let ignored_de = serde_ignored::Deserializer::new(config, &mut cb);
        let config: ConfigImpl = serde_path_to_error::deserialize(ignored_de).map_err(|error| {
            // The path is reported by serde_path_to_error, so drop it from the config error.
            let path = error.path().clone();
            let error = match error.into_inner() {
                ConfigError::At { error, .. } => *error,
                other => other,
            };
            ConfigParseErrorKind::DeserializeError(Box::new(serde_path_to_error::Error::new(
                path, error,
            )))
        })?;

        Ok((config, ignored))
    }
}

/// A configuration profile for disttrial.
///
/// Returned by [`DistTrialConfig::profile`].
#[derive(Clone, Debug)]
pub struct DistTrialProfile<'cfg> {
    name: String,
    default_profile: &'cfg DefaultProfileImpl,
    custom_profile: Option<&'cfg CustomProfileImpl>,
}

impl DistTrialProfile<'_> {
    /// Returns the name of the profile.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of workers to start.
    pub fn jobs(&self) -> Jobs {
        self.custom_profile
            .and_then(|profile| profile.jobs)
            .unwrap_or(self.default_profile.jobs)
    }

    /// Returns the base working directory.
    pub fn working_directory(&self) -> &Utf8Path {
        self.custom_profile
            .and_then(|profile| profile.working_directory.as_deref())
            .unwrap_or(&self.default_profile.working_directory)
    }

    /// Returns the path of the combined test log.
    pub fn log_file(&self) -> &Utf8Path {
        self.custom_profile
            .and_then(|profile| profile.log_file.as_deref())
            .unwrap_or(&self.default_profile.log_file)
    }

    /// Returns true if dispatch stops after the first unsuccessful test.
    pub fn exit_first(&self) -> bool {
        self.custom_profile
            .and_then(|profile| profile.exit_first)
            .unwrap_or(self.default_profile.exit_first)
    }

    /// Returns true if the suite is repeated until a pass is unsuccessful.
    pub fn until_failure(&self) -> bool {
        self.custom_profile
            .and_then(|profile| profile.until_failure)
            .unwrap_or(self.default_profile.until_failure)
    }

    /// Returns the extra arguments passed to every worker.
    pub fn worker_args(&self) -> &[String] {
        self.custom_profile
            .and_then(|profile| profile.worker_args.as_deref())
            .unwrap_or(&self.default_profile.worker_args)
    }
}

/// Type for the `jobs` config key and the `--jobs` option.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Jobs {
    /// Start this many workers.
    Count(NonZeroUsize),

    /// Start as many workers as there are logical CPUs.
    NumCpus,
}

impl Jobs {
    /// Returns the number of workers to start.
    pub fn compute(self) -> NonZeroUsize {
        match self {
            Self::Count(count) => count,
            Self::NumCpus => num_cpus(),
        }
    }

    fn from_signed(count: i64) -> Option<Self> {
        match count {
            0 => None,
            count if count < 0 => {
                let cpus = num_cpus().get() as i64;
                let count = (cpus + count).max(1) as usize;
                Some(Self::Count(NonZeroUsize::new(count).unwrap_or(NonZeroUsize::MIN)))
            }
            count => NonZeroUsize::new(count as usize).map(Self::Count),
        }
    }
}

fn num_cpus() -> NonZeroUsize {
    std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN)
}

impl FromStr for Jobs {
    type Err = JobsParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "num-cpus" {
            return Ok(Self::NumCpus);
        }
        let count: i64 = s
            .parse()
            .map_err(|error: std::num::ParseIntError| JobsParseError::new(s, error.to_string()))?;
        Self::from_signed(count).ok_or_else(|| JobsParseError::new(s, "jobs may not be 0"))
    }
}

impl fmt::Display for Jobs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(count) => write!(f, "{count}"),
            Self::NumCpus => write!(f, "num-cpus"),
        }
    }
}

impl<'de> Deserialize<'de> for Jobs {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = Jobs;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "a non-zero integer or the string \"num-cpus\"")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v == "num-cpus" {
                    Ok(Jobs::NumCpus)
                } else {
                    Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Str(v),
                        &self,
                    ))
                }
            }

            // TOML integers are i64.
            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Jobs::from_signed(v).ok_or_else(|| {
                    serde::de::Error::invalid_value(serde::de::Unexpected::Signed(v), &self)
                })
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                match i64::try_from(v) {
                    Ok(v) => self.visit_i64(v),
                    Err(_) => Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Unsigned(v),
                        &self,
                    )),
                }
            }
        }

        deserializer.deserialize_any(V)
    }
}

#[derive(Clone, Debug, Deserialize)]
struct ConfigImpl {
    #[serde(rename = "profile")]
    profiles: ProfilesImpl,
}

#[derive(Clone, Debug, Deserialize)]
struct ProfilesImpl {
    default: DefaultProfileImpl,
    #[serde(flatten)]
    other: BTreeMap<String, CustomProfileImpl>,
}

impl ProfilesImpl {
    fn get(&self, profile: &str) -> Result<Option<&CustomProfileImpl>, ProfileNotFound> {
        match profile {
            DistTrialConfig::DEFAULT_PROFILE => Ok(None),
            other => self.other.get(other).map(Some).ok_or_else(|| {
                ProfileNotFound::new(
                    profile,
                    std::iter::once(DistTrialConfig::DEFAULT_PROFILE)
                        .chain(self.other.keys().map(String::as_str)),
                )
            }),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct DefaultProfileImpl {
    jobs: Jobs,
    working_directory: Utf8PathBuf,
    log_file: Utf8PathBuf,
    exit_first: bool,
    until_failure: bool,
    worker_args: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CustomProfileImpl {
    #[serde(default)]
    jobs: Option<Jobs>,
    #[serde(default)]
    working_directory: Option<Utf8PathBuf>,
    #[serde(default)]
    log_file: Option<Utf8PathBuf>,
    #[serde(default)]
    exit_first: Option<bool>,
    #[serde(default)]
    until_failure: Option<bool>,
    #[serde(default)]
    worker_args: Option<Vec<String>>,
}
