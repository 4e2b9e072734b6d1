//! Combine methods the connect backend knows how to stage.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A combine `-M` method, matched by exact name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Method {
    AsymptoticLimits,
    /// Datacard to workspace conversion (`text2workspace.py`).
    T2W,
    Impacts,
    FitDiagnostics,
    Other(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::AsymptoticLimits => "AsymptoticLimits",
            Method::T2W => "T2W",
            Method::Impacts => "Impacts",
            Method::FitDiagnostics => "FitDiagnostics",
            Method::Other(name) => name,
        }
    }
}

impl From<&str> for Method {
    fn from(s: &str) -> Self {
        match s {
            "AsymptoticLimits" => Method::AsymptoticLimits,
            "T2W" => Method::T2W,
            "Impacts" => Method::Impacts,
            "FitDiagnostics" => Method::FitDiagnostics,
            other => Method::Other(other.to_string()),
        }
    }
}

impl From<String> for Method {
    fn from(s: String) -> Self {
        Method::from(s.as_str())
    }
}

impl From<Method> for String {
    fn from(method: Method) -> Self {
        method.as_str().to_string()
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which half of an impacts run is being submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImpactStage {
    /// The initial fit of the parameters of interest.
    InitialFit,
    /// One fit per nuisance parameter.
    Fits,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_methods_match_exactly() {
        assert_eq!(Method::from("FitDiagnostics"), Method::FitDiagnostics);
        assert_eq!(Method::from("T2W"), Method::T2W);
        // No substring matching: a longer name is a different method.
        assert_eq!(
            Method::from("ImpactsV2"),
            Method::Other("ImpactsV2".to_string())
        );
    }

    #[test]
    fn other_method_keeps_its_name() {
        let method = Method::from("MultiDimFit");
        assert_eq!(method.to_string(), "MultiDimFit");
    }
}
