use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::catalog::ResourceKind;

/// key: credit-pack-catalog -> purchasable one-time bundles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditPackage {
    pub resource: ResourceKind,
    pub credits: u64,
    pub price_cents: u64,
}

#[derive(Debug, Clone)]
pub struct CreditPackCatalog {
    packages: BTreeMap<String, CreditPackage>,
}

impl CreditPackCatalog {
    pub fn get(&self, package_id: &str) -> Option<&CreditPackage> {
        self.packages.get(package_id)
    }

    pub fn packages(&self) -> impl Iterator<Item = (&str, &CreditPackage)> {
        self.packages.iter().map(|(id, package)| (id.as_str(), package))
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let packages = serde_json::from_str(raw)?;
        Ok(Self { packages })
    }
}

impl Default for CreditPackCatalog {
    fn default() -> Self {
        let entries = [
            ("verify_500", ResourceKind::Verification, 500, 1900),
            ("verify_2000", ResourceKind::Verification, 2000, 5900),
            ("search_1000", ResourceKind::Search, 1000, 900),
            ("minutes_100", ResourceKind::CallMinute, 100, 2500),
            ("sms_500", ResourceKind::Sms, 500, 1500),
        ];
        let packages = entries
            .into_iter()
            .map(|(id, resource, credits, price_cents)| {
                (
                    id.to_string(),
                    CreditPackage {
                        resource,
                        credits,
                        price_cents,
                    },
                )
            })
            .collect();
        Self { packages }
    }
}
