use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Cross-connector schemas a mapper can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnifiedEntityName {
    Account,
    Transaction,
    Contact,
    Company,
}

impl UnifiedEntityName {
    pub const ALL: [UnifiedEntityName; 4] = [
        UnifiedEntityName::Account,
        UnifiedEntityName::Transaction,
        UnifiedEntityName::Contact,
        UnifiedEntityName::Company,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::Transaction => "transaction",
            Self::Contact => "contact",
            Self::Company => "company",
        }
    }

    /// Every field a unified record of this kind carries (possibly `null`).
    pub fn fields(&self) -> &'static [&'static str] {
        match self {
            Self::Account => &[
                "id",
                "name",
                "type",
                "currency",
                "current_balance",
                "available_balance",
                "institution_name",
                "updated_at",
            ],
            Self::Transaction => &[
                "id",
                "account_id",
                "date",
                "amount",
                "currency",
                "description",
                "payee",
                "category",
                "pending",
                "updated_at",
            ],
            Self::Contact => &[
                "id",
                "first_name",
                "last_name",
                "email",
                "phone",
                "company_name",
                "updated_at",
            ],
            Self::Company => &[
                "id",
                "name",
                "domain",
                "industry",
                "employee_count",
                "updated_at",
            ],
        }
    }
}

impl fmt::Display for UnifiedEntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnifiedEntityName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown unified entity '{s}'")))
    }
}
