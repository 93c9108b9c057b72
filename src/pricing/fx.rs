//! FX Conversion
//!
//! Resolves the rate for productCcy -> accountBaseCcy from the two-tier
//! cache: direct pair, then inverse pair, then triangulation through the
//! configured pivot currency. A stale leg taints the whole conversion so
//! valuation can surface a warning.

use crate::cache::TieredCache;
use crate::models::round_fx;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FxRateUsed {
    pub rate: Decimal,
    pub stale: bool,
    pub triangulated: bool,
}

impl FxRateUsed {
    pub const IDENTITY: FxRateUsed = FxRateUsed {
        rate: Decimal::ONE,
        stale: false,
        triangulated: false,
    };
}

pub struct FxConverter {
    cache: Arc<TieredCache>,
    pivot: String,
}

impl FxConverter {
    pub fn new(cache: Arc<TieredCache>, pivot: String) -> Self {
        Self { cache, pivot }
    }

    /// Rate converting one unit of `from` into `to`.
    pub async fn rate(&self, from: &str, to: &str) -> Option<FxRateUsed> {
        if from == to {
            return Some(FxRateUsed::IDENTITY);
        }
        if let Some((rate, stale)) = self.leg(from, to).await {
            return Some(FxRateUsed {
                rate: round_fx(rate),
                stale,
                triangulated: false,
            });
        }
        // Triangulate through the pivot
        if from != self.pivot && to != self.pivot {
            let first = self.leg(from, &self.pivot).await?;
            let second = self.leg(&self.pivot, to).await?;
            return Some(FxRateUsed {
                rate: round_fx(first.0 * second.0),
                stale: first.1 || second.1,
                triangulated: true,
            });
        }
        None
    }

    /// Like `rate`, but a missing chain degrades to the identity rate with
    /// a warning so valuation can proceed in local currency.
    pub async fn rate_or_identity(&self, from: &str, to: &str) -> FxRateUsed {
        match self.rate(from, to).await {
            Some(rate) => rate,
            None => {
                metrics::counter!("fx_rate_missing_total", 1);
                warn!(from, to, "no FX chain available, using identity rate");
                FxRateUsed::IDENTITY
            }
        }
    }

    /// One hop: direct pair or inverted inverse pair.
    async fn leg(&self, from: &str, to: &str) -> Option<(Decimal, bool)> {
        if from == to {
            return Some((Decimal::ONE, false));
        }
        if let Some(lookup) = self.cache.get_fx(&format!("{from}/{to}")).await {
            return Some((lookup.entry.value, lookup.stale));
        }
        if let Some(lookup) = self.cache.get_fx(&format!("{to}/{from}")).await {
            if !lookup.entry.value.is_zero() {
                return Some((Decimal::ONE / lookup.entry.value, lookup.stale));
            }
        }
        None
    }
}
