use clubhouse_core::models::{Offer, PricingSnapshot};
use clubhouse_core::{LedgerError, LedgerResult, Money};
use serde::{Deserialize, Serialize};

pub const BPS_DENOMINATOR: u32 = 10_000;

/// Platform commission in basis points (1/100 of a percent).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommissionRate(u32);

impl CommissionRate {
    pub fn from_bps(bps: u32) -> LedgerResult<Self> {
        if bps > BPS_DENOMINATOR {
            return Err(LedgerError::Validation(format!(
                "Commission rate {} bps exceeds 100%",
                bps
            )));
        }
        Ok(Self(bps))
    }

    pub fn bps(&self) -> u32 {
        self.0
    }

    /// Platform fee for `total`, rounded half-up to the nearest minor unit.
    pub fn fee_on(&self, total: Money) -> Money {
        let scaled = i128::from(total) * i128::from(self.0) + i128::from(BPS_DENOMINATOR / 2);
        (scaled / i128::from(BPS_DENOMINATOR)) as Money
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PricingInput {
    pub base_price: Money,
    pub promo_price: Option<Money>,
    pub quantity: u32,
    pub commission_bps: Option<u32>,
}

impl PricingInput {
    pub fn from_offer(offer: &Offer, quantity: u32) -> Self {
        Self {
            base_price: offer.base_price,
            promo_price: offer.promo_price,
            quantity,
            commission_bps: offer.commission_bps,
        }
    }

    /// The promotional price wins whenever one is set.
    pub fn unit_price(&self) -> Money {
        self.promo_price.unwrap_or(self.base_price)
    }
}

/// Splits a booking total between platform and partner.
#[derive(Debug, Clone, Copy)]
pub struct CommissionCalculator {
    default_rate: CommissionRate,
}

impl CommissionCalculator {
    pub fn new(default_rate: CommissionRate) -> Self {
        Self { default_rate }
    }

    pub fn default_rate(&self) -> CommissionRate {
        self.default_rate
    }

    pub fn effective_rate(&self, override_bps: Option<u32>) -> LedgerResult<CommissionRate> {
        match override_bps {
            Some(bps) => CommissionRate::from_bps(bps),
            None => Ok(self.default_rate),
        }
    }

    pub fn snapshot(&self, input: &PricingInput) -> LedgerResult<PricingSnapshot> {
        if input.quantity == 0 {
            return Err(LedgerError::InvalidAmount("Quantity must be at least 1".to_string()));
        }

        let unit_amount = input.unit_price();
        let total_amount = unit_amount
            .checked_mul(Money::from(input.quantity))
            .ok_or_else(|| LedgerError::InvalidAmount("Booking total overflows".to_string()))?;
        if total_amount <= 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "Booking total must be positive, got {}",
                total_amount
            )));
        }

        let rate = self.effective_rate(input.commission_bps)?;
        let platform_fee = rate.fee_on(total_amount);

        Ok(PricingSnapshot {
            unit_amount,
            quantity: input.quantity,
            total_amount,
            commission_bps: rate.bps(),
            platform_fee,
            partner_earnings: total_amount - platform_fee,
        })
    }
}
