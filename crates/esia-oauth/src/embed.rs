//! Scope-gated `embed` sections of the person (`/rs/prns/{oid}`) resource.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A sub-resource of the person profile that can be embedded in a details query.
///
/// Variants are declared in the order they appear in the `embed=(...)` list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EmbedSection {
    #[serde(rename = "contacts.elements")]
    Contacts,
    #[serde(rename = "addresses.elements")]
    Addresses,
    #[serde(rename = "documents.elements")]
    Documents,
    #[serde(rename = "vehicles.elements")]
    Vehicles,
    #[serde(rename = "organizations.elements")]
    Organizations,
}

impl EmbedSection {
    pub const ALL: [EmbedSection; 5] = [
        Self::Contacts,
        Self::Addresses,
        Self::Documents,
        Self::Vehicles,
        Self::Organizations,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contacts => "contacts.elements",
            Self::Addresses => "addresses.elements",
            Self::Documents => "documents.elements",
            Self::Vehicles => "vehicles.elements",
            Self::Organizations => "organizations.elements",
        }
    }

    /// Scopes that unlock this section. Any one of them is enough.
    pub fn authorizing_scopes(&self) -> &'static [&'static str] {
        match self {
            Self::Contacts => &["contacts", "email", "mobile"],
            Self::Addresses => &["contacts"],
            Self::Documents => &[
                "id_doc",
                "medical_doc",
                "military_doc",
                "foreign_passport_doc",
                "drivers_licence_doc",
                "birth_cert_doc",
                "residence_doc",
                "temporary_residence_doc",
            ],
            Self::Vehicles => &["vehicles"],
            Self::Organizations => &["usr_org"],
        }
    }

    pub fn is_authorized_by<S: AsRef<str>>(&self, granted: &[S]) -> bool {
        self.authorizing_scopes()
            .iter()
            .any(|scope| granted.iter().any(|g| g.as_ref() == *scope))
    }
}

impl fmt::Display for EmbedSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sections permitted by `granted`, in declaration order.
///
/// Scope names are compared exactly. Scopes taken from a URL-form `scope`
/// claim arrive as paths (`/usr_org`) and therefore never match.
pub fn resolve<I, S>(granted: I) -> Vec<EmbedSection>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let granted: Vec<S> = granted.into_iter().collect();
    EmbedSection::ALL
        .into_iter()
        .filter(|section| section.is_authorized_by(&granted))
        .collect()
}

/// `(a,b,c)` as expected by the `embed` query parameter.
pub fn embed_list(sections: &[EmbedSection]) -> String {
    let names: Vec<&str> = sections.iter().map(EmbedSection::as_str).collect();
    format!("({})", names.join(","))
}
