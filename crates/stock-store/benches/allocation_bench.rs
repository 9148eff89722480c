use chrono::NaiveDate;
use criterion::{Criterion, criterion_group, criterion_main};
use stock_store::{
    InMemoryStore, LotLedgerExt, MedicineId, Money, NewLot, TransactionCoordinator, UnitOfWork,
};

async fn seeded_store(lots: u32) -> InMemoryStore {
    let store = InMemoryStore::new();
    let base = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
    for i in 0..lots {
        store
            .insert_lot(NewLot::new(
                MedicineId::new(1),
                format!("B-{i}"),
                base + chrono::Days::new(u64::from(i)),
                10,
                Money::from_cents(100),
            ))
            .await;
    }
    store
}

fn bench_allocate_single_lot(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("allocation/single_lot", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = seeded_store(1).await;
                let mut uow = store.begin().await.unwrap();
                uow.lots().allocate(MedicineId::new(1), 5).await.unwrap();
                uow.commit().await.unwrap();
            });
        });
    });
}

fn bench_allocate_across_many_lots(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("allocation/across_50_lots", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = seeded_store(100).await;
                let mut uow = store.begin().await.unwrap();
                uow.lots().allocate(MedicineId::new(1), 500).await.unwrap();
                uow.commit().await.unwrap();
            });
        });
    });
}

fn bench_shortfall_and_rollback(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("allocation/shortfall_rollback", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = seeded_store(20).await;
                let mut uow = store.begin().await.unwrap();
                let _ = uow.lots().allocate(MedicineId::new(1), 1_000).await;
                uow.rollback().await.unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_allocate_single_lot,
    bench_allocate_across_many_lots,
    bench_shortfall_and_rollback
);
criterion_main!(benches);
