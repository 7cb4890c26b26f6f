//! Fixtures shared by the service tests.

use chrono::{DateTime, NaiveDate, Utc};
use clubhouse_core::models::{
    BillingPeriod, Booking, BookingStatus, InstallmentDue, InstallmentStatus, Offer, Partner,
    PaymentInstallment, Payout, PayoutStatus, PricingSnapshot, Subscription, SubscriptionStatus,
};
use clubhouse_core::Money;
use clubhouse_store::InMemoryStore;
use uuid::Uuid;

pub struct Fixture {
    pub partner: Partner,
    pub offer: Offer,
    pub booking: Booking,
    pub subscriber_id: Uuid,
}

pub fn partner(owner_user_id: Uuid) -> Partner {
    let id = Uuid::new_v4();
    Partner {
        id,
        owner_user_id,
        name: "Harbour Yoga".to_string(),
        email: "owner@harbour.example".into(),
        connected_account_id: Some(format!("acct_{}", id.simple())),
        charges_enabled: true,
        pending_penalties: 0,
    }
}

pub fn offer(partner_id: Uuid, base_price: Money) -> Offer {
    Offer {
        id: Uuid::new_v4(),
        partner_id,
        title: "Sunrise flow".to_string(),
        base_price,
        promo_price: None,
        commission_bps: None,
    }
}

fn booking(
    partner_id: Uuid,
    offer_id: Uuid,
    subscriber_id: Uuid,
    amount: Money,
    status: BookingStatus,
    payment_intent_id: Option<&str>,
    created_at: DateTime<Utc>,
) -> Booking {
    let platform_fee = amount / 5;
    Booking {
        id: Uuid::new_v4(),
        partner_id,
        offer_id,
        subscriber_id,
        amount,
        status,
        pricing: PricingSnapshot {
            unit_amount: amount,
            quantity: 1,
            total_amount: amount,
            commission_bps: 2000,
            platform_fee,
            partner_earnings: amount - platform_fee,
        },
        payment_intent_id: payment_intent_id.map(str::to_string),
        cancellation: None,
        created_at,
        updated_at: created_at,
    }
}

/// Partner, offer, subscriber and one booking at 20% commission.
pub fn seed_booking(
    store: &InMemoryStore,
    amount: Money,
    status: BookingStatus,
    payment_intent_id: Option<&str>,
) -> Fixture {
    seed_booking_at(store, amount, status, payment_intent_id, Utc::now())
}

pub fn seed_booking_at(
    store: &InMemoryStore,
    amount: Money,
    status: BookingStatus,
    payment_intent_id: Option<&str>,
    created_at: DateTime<Utc>,
) -> Fixture {
    let partner = partner(Uuid::new_v4());
    store.seed_partner(partner.clone());
    let offer = offer(partner.id, amount);
    store.seed_offer(offer.clone());
    let subscriber_id = Uuid::new_v4();
    store.seed_subscriber(subscriber_id, "member@club.example", Some("Ada"));
    let booking = booking(partner.id, offer.id, subscriber_id, amount, status, payment_intent_id, created_at);
    store.seed_booking(booking.clone());
    Fixture {
        partner,
        offer,
        booking,
        subscriber_id,
    }
}

/// Another booking for the same partner, offer and subscriber.
pub fn add_booking_at(
    store: &InMemoryStore,
    fx: &Fixture,
    amount: Money,
    status: BookingStatus,
    created_at: DateTime<Utc>,
) -> Booking {
    let booking = booking(fx.partner.id, fx.offer.id, fx.subscriber_id, amount, status, None, created_at);
    store.seed_booking(booking.clone());
    booking
}

/// A pending payout for last month with `net = gross - penalties`.
pub fn payout(partner_id: Uuid, gross: Money, penalties: Money) -> Payout {
    let now = Utc::now();
    Payout {
        id: Uuid::new_v4(),
        partner_id,
        period: BillingPeriod::prior_month(now.date_naive()).unwrap(),
        gross_earnings: gross,
        penalties_applied: penalties,
        booking_count: 1,
        net_amount: gross - penalties,
        status: PayoutStatus::Pending,
        transfer_id: None,
        transfer_attempted_at: None,
        transfer_round: 0,
        statement_url: None,
        failure_note: None,
        created_at: now,
        updated_at: now,
        paid_at: None,
    }
}

pub fn subscription(external_id: &str, status: SubscriptionStatus) -> Subscription {
    Subscription {
        id: Uuid::new_v4(),
        subscriber_id: Uuid::new_v4(),
        subscriber_email: "member@club.example".into(),
        subscriber_name: Some("Ada".to_string()),
        external_subscription_id: external_id.to_string(),
        status,
        current_period_end: None,
        cancel_at_period_end: false,
        welcome_sent_at: None,
        updated_at: Utc::now(),
    }
}

pub fn installment(due_date: NaiveDate, status: InstallmentStatus) -> InstallmentDue {
    InstallmentDue {
        installment: PaymentInstallment {
            id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            sequence: 2,
            due_date,
            amount: 4_500,
            status,
        },
        plan_description: "Annual membership".to_string(),
        installment_count: 3,
        subscriber_email: "member@club.example".into(),
        subscriber_name: Some("Ada".to_string()),
    }
}
