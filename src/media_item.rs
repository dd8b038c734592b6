use std::path::{Path, PathBuf};

/// Option name forcing the software decode path on an item.
pub const NO_HARDWARE_DECODE: &str = "no-hwdec";

/// Whether an option attached to a media item came from a trusted source.
/// The decode path only honors trusted options; untrusted ones are carried
/// for diagnostics and otherwise ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptionTrust {
    Trusted,
    Untrusted,
}

#[derive(Clone, Debug)]
struct ItemOption {
    name: String,
    trust: OptionTrust,
}

/// A resolved playable item: a locator the engine can open, plus the
/// options attached by whoever resolved it.
#[derive(Clone, Debug)]
pub struct MediaItem {
    mrl: String,
    location: PathBuf,
    options: Vec<ItemOption>,
}

impl MediaItem {
    /// Resolve a media locator into a playable item.
    ///
    /// Accepts plain filesystem paths and `file://` locators (prefix
    /// stripped). Empty locators and locators containing NUL are rejected.
    pub fn new(mrl: &str) -> Option<Self> {
        let trimmed = mrl.trim();
        if trimmed.is_empty() || trimmed.contains('\0') {
            return None;
        }

        let location = match trimmed.strip_prefix("file://") {
            Some("") => return None,
            Some(rest) => PathBuf::from(rest),
            None => PathBuf::from(trimmed),
        };

        Some(Self {
            mrl: trimmed.to_string(),
            location,
            options: Vec::new(),
        })
    }

    pub fn add_option(&mut self, name: &str, trust: OptionTrust) {
        self.options.push(ItemOption {
            name: name.to_string(),
            trust,
        });
    }

    pub fn mrl(&self) -> &str {
        &self.mrl
    }

    /// Filesystem location the locator resolved to.
    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn has_trusted_option(&self, name: &str) -> bool {
        self.options
            .iter()
            .any(|opt| opt.name == name && opt.trust == OptionTrust::Trusted)
    }
}
