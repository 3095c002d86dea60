use std::fmt::{Display, Formatter};
use std::str::FromStr;

use thiserror::Error;

use delocate_platform::{MacOSVersion, PlatformTag};

/// A parsed wheel filename, `{name}-{version}[-{build}]-{python}-{abi}-{platform}.whl`.
///
/// Each tag component may be a compressed tag set separated by `.`.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct WheelFilename {
    pub name: String,
    pub version: String,
    build_tag: Option<String>,
    python_tags: Vec<String>,
    abi_tags: Vec<String>,
    platform_tags: Vec<PlatformTag>,
}

impl FromStr for WheelFilename {
    type Err = WheelFilenameError;

    fn from_str(filename: &str) -> Result<Self, Self::Err> {
        let stem = filename.strip_suffix(".whl").ok_or_else(|| {
            WheelFilenameError::InvalidWheelFileName(
                filename.to_string(),
                "Must end with .whl".to_string(),
            )
        })?;
        Self::parse(stem, filename)
    }
}

impl Display for WheelFilename {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.whl", self.stem())
    }
}

impl WheelFilename {
    /// The wheel filename without the extension.
    pub fn stem(&self) -> String {
        let platform_tags = self
            .platform_tags
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(".");
        match &self.build_tag {
            Some(build_tag) => format!(
                "{}-{}-{}-{}-{}-{}",
                self.name,
                self.version,
                build_tag,
                self.python_tags.join("."),
                self.abi_tags.join("."),
                platform_tags
            ),
            None => format!(
                "{}-{}-{}-{}-{}",
                self.name,
                self.version,
                self.python_tags.join("."),
                self.abi_tags.join("."),
                platform_tags
            ),
        }
    }

    /// Return the wheel's Python tags.
    pub fn python_tags(&self) -> &[String] {
        &self.python_tags
    }

    /// Return the wheel's ABI tags.
    pub fn abi_tags(&self) -> &[String] {
        &self.abi_tags
    }

    /// Return the wheel's platform tags.
    pub fn platform_tags(&self) -> &[PlatformTag] {
        &self.platform_tags
    }

    /// Return the wheel's build tag, if present.
    pub fn build_tag(&self) -> Option<&str> {
        self.build_tag.as_deref()
    }

    /// Returns `true` if the wheel is platform-independent (`any`).
    pub fn is_pure(&self) -> bool {
        self.platform_tags
            .iter()
            .all(|tag| matches!(tag, PlatformTag::Any))
    }

    /// The minimum macOS version across all macOS platform tags, if any.
    pub fn macos_version(&self) -> Option<MacOSVersion> {
        self.platform_tags
            .iter()
            .filter_map(PlatformTag::macos_version)
            .min()
    }

    /// Return a copy of this filename with the platform tags replaced.
    #[must_use]
    pub fn with_platform_tags(&self, platform_tags: &[PlatformTag]) -> Self {
        Self {
            platform_tags: platform_tags.to_vec(),
            ..self.clone()
        }
    }

    /// Return the `{python}-{abi}-{platform}` triples this filename expands to.
    pub fn expanded_tags(&self) -> Vec<String> {
        let mut tags = Vec::new();
        for python_tag in &self.python_tags {
            for abi_tag in &self.abi_tags {
                for platform_tag in &self.platform_tags {
                    tags.push(format!("{python_tag}-{abi_tag}-{platform_tag}"));
                }
            }
        }
        tags
    }

    /// Parse a wheel filename from the stem (e.g., `foo-1.2.3-py3-none-any`).
    ///
    /// The originating `filename` is used for high-fidelity error messages.
    fn parse(stem: &str, filename: &str) -> Result<Self, WheelFilenameError> {
        // The wheel filename should contain either five or six entries. If six, then the third
        // entry is the build tag. If five, then the third entry is the Python tag.
        // https://www.python.org/dev/peps/pep-0427/#file-name-convention
        let mut splitter = memchr::Memchr::new(b'-', stem.as_bytes());

        let Some(version) = splitter.next() else {
            return Err(WheelFilenameError::InvalidWheelFileName(
                filename.to_string(),
                "Must have a version".to_string(),
            ));
        };

        let Some(build_tag_or_python_tag) = splitter.next() else {
            return Err(WheelFilenameError::InvalidWheelFileName(
                filename.to_string(),
                "Must have a Python tag".to_string(),
            ));
        };

        let Some(python_tag_or_abi_tag) = splitter.next() else {
            return Err(WheelFilenameError::InvalidWheelFileName(
                filename.to_string(),
                "Must have an ABI tag".to_string(),
            ));
        };

        let Some(abi_tag_or_platform_tag) = splitter.next() else {
            return Err(WheelFilenameError::InvalidWheelFileName(
                filename.to_string(),
                "Must have a platform tag".to_string(),
            ));
        };

        let (name, version, build_tag, python_tag, abi_tag, platform_tag) =
            if let Some(platform_tag) = splitter.next() {
                if splitter.next().is_some() {
                    return Err(WheelFilenameError::InvalidWheelFileName(
                        filename.to_string(),
                        "Must have 5 or 6 components, but has more".to_string(),
                    ));
                }
                (
                    &stem[..version],
                    &stem[version + 1..build_tag_or_python_tag],
                    Some(&stem[build_tag_or_python_tag + 1..python_tag_or_abi_tag]),
                    &stem[python_tag_or_abi_tag + 1..abi_tag_or_platform_tag],
                    &stem[abi_tag_or_platform_tag + 1..platform_tag],
                    &stem[platform_tag + 1..],
                )
            } else {
                (
                    &stem[..version],
                    &stem[version + 1..build_tag_or_python_tag],
                    None,
                    &stem[build_tag_or_python_tag + 1..python_tag_or_abi_tag],
                    &stem[python_tag_or_abi_tag + 1..abi_tag_or_platform_tag],
                    &stem[abi_tag_or_platform_tag + 1..],
                )
            };

        if name.is_empty() {
            return Err(WheelFilenameError::InvalidPackageName(filename.to_string()));
        }
        if version.is_empty() {
            return Err(WheelFilenameError::InvalidWheelFileName(
                filename.to_string(),
                "Must have a version".to_string(),
            ));
        }
        if let Some(build_tag) = build_tag {
            if !build_tag.starts_with(|c: char| c.is_ascii_digit()) {
                return Err(WheelFilenameError::InvalidBuildTag(
                    filename.to_string(),
                    build_tag.to_string(),
                ));
            }
        }

        let python_tags = split_tags(python_tag);
        if python_tags.is_empty() {
            return Err(WheelFilenameError::MissingLanguageTag(filename.to_string()));
        }
        let abi_tags = split_tags(abi_tag);
        if abi_tags.is_empty() {
            return Err(WheelFilenameError::MissingAbiTag(filename.to_string()));
        }
        let platform_tags = split_tags(platform_tag)
            .into_iter()
            .map(|tag| {
                PlatformTag::from_str(&tag).map_err(|err| {
                    WheelFilenameError::InvalidPlatformTag(filename.to_string(), err)
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if platform_tags.is_empty() {
            return Err(WheelFilenameError::MissingPlatformTag(filename.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            version: version.to_string(),
            build_tag: build_tag.map(ToString::to_string),
            python_tags,
            abi_tags,
            platform_tags,
        })
    }
}

fn split_tags(tags: &str) -> Vec<String> {
    tags.split('.')
        .filter(|tag| !tag.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[derive(Error, Debug)]
pub enum WheelFilenameError {
    #[error("The wheel filename \"{0}\" is invalid: {1}")]
    InvalidWheelFileName(String, String),
    #[error("The wheel filename \"{0}\" has an invalid package name")]
    InvalidPackageName(String),
    #[error("The wheel filename \"{0}\" has an invalid build tag: {1}")]
    InvalidBuildTag(String, String),
    #[error("The wheel filename \"{0}\" has an invalid platform tag: {1}")]
    InvalidPlatformTag(String, delocate_platform::Error),
    #[error("The wheel filename \"{0}\" is missing a language tag")]
    MissingLanguageTag(String),
    #[error("The wheel filename \"{0}\" is missing an ABI tag")]
    MissingAbiTag(String),
    #[error("The wheel filename \"{0}\" is missing a platform tag")]
    MissingPlatformTag(String),
}
