//! Framework version comparison

/// How the framework version relates to a version supplied by a client script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOrder {
    /// The framework is older than the supplied version.
    Older,
    Same,
    /// The framework is newer than the supplied version.
    Newer,
}

/// Dotted numeric framework version.
#[derive(Debug, Clone)]
pub struct Version {
    value: String,
}

impl Version {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Compare the framework version against a client-supplied version.
    /// Missing components are treated as zero, so `"1.2"` equals `"1.2.0"`.
    pub fn compare_to(&self, client_version: &str) -> VersionOrder {
        let parse = |v: &str| -> Vec<u64> {
            v.split('.')
                .map(|d| d.trim().parse::<u64>().unwrap_or(0))
                .collect()
        };
        let client = parse(client_version);
        let own = parse(&self.value);
        let len = client.len().max(own.len());
        for idx in 0..len {
            let a = client.get(idx).copied().unwrap_or(0);
            let b = own.get(idx).copied().unwrap_or(0);
            if a == b {
                continue;
            }
            return if a < b {
                VersionOrder::Newer
            } else {
                VersionOrder::Older
            };
        }
        VersionOrder::Same
    }
}
