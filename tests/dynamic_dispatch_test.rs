use futures::StreamExt;
use payment_process::domain::claim::ClaimType;
use payment_process::domain::payment_center::{CreateAck, PaymentCenter, PaymentCenterId, PaymentCenterKey};
use payment_process::domain::ports::{ClaimSource, Repositories};
use payment_process::infrastructure::in_memory::InMemoryStore;
use rust_decimal_macros::dec;

mod common;
use common::{NPI, TAX_ID, claim, provider_event};

#[tokio::test]
async fn test_stores_as_trait_objects() {
    let store = InMemoryStore::new();
    store.insert_event(provider_event("PE-1")).await;
    store
        .load_claims("PE-1", vec![claim("C1", "P1", ClaimType::Paid, &[dec!(10.00)])])
        .await;
    let repos = Repositories::from_store(store.clone());

    let key = PaymentCenterKey::Provider {
        tax_id: TAX_ID.into(),
        npi: NPI.into(),
    };
    let center = PaymentCenter::from_claim(PaymentCenterId(1), key.clone(), None);

    // Verify Send + Sync by spawning tasks
    let centers = repos.payment_centers.clone();
    let pc_handle = tokio::spawn(async move {
        centers.create_payment_centers(vec![center]).await.unwrap();
        centers.lookup_payment_centers(&[key]).await.unwrap()
    });

    let events = repos.events.clone();
    let event_handle = tokio::spawn(async move { events.load_payment_event("PE-1").await.unwrap() });

    let claims = repos.claims.clone();
    let claim_handle = tokio::spawn(async move {
        claims
            .fetch_claims("PE-1", ClaimSource::WorkingSet, None)
            .collect::<Vec<_>>()
            .await
    });

    let found = pc_handle.await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(store.payment_center_count().await, 1);

    assert_eq!(event_handle.await.unwrap().event_id, "PE-1");

    let fetched = claim_handle.await.unwrap();
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].as_ref().unwrap().claim_id, "C1");
}

#[tokio::test]
async fn test_concurrent_creates_of_one_key_yield_one_center() {
    let store = InMemoryStore::new();
    let repos = Repositories::from_store(store.clone());
    let key = PaymentCenterKey::Provider {
        tax_id: TAX_ID.into(),
        npi: NPI.into(),
    };

    let mut handles = Vec::new();
    for id in 1..=8u64 {
        let centers = repos.payment_centers.clone();
        let center = PaymentCenter::from_claim(PaymentCenterId(id), key.clone(), None);
        handles.push(tokio::spawn(async move {
            centers.create_payment_centers(vec![center]).await.unwrap()
        }));
    }

    let mut created = 0;
    for handle in handles {
        for ack in handle.await.unwrap() {
            if matches!(ack, CreateAck::Created(_)) {
                created += 1;
            }
        }
    }

    assert_eq!(created, 1);
    assert_eq!(store.payment_center_count().await, 1);
}
