use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use remitdesk::conversion::{convert, quote_send};
use remitdesk::ledger::{LedgerService, SendMoneyCommand, TransferCommand};
use remitdesk::models::{Currency, DeliveryRoute, DeskSettings, RateSet};
use remitdesk::queries::RecordQueries;
use remitdesk::storage::{InMemoryStorage, StorageBackend};

fn rates() -> RateSet {
    RateSet {
        primary_to_home: dec!(22.5),
        secondary_to_home: dec!(23.1),
        primary_to_secondary: dec!(0.98),
    }
}

fn setup() -> (Arc<dyn StorageBackend>, LedgerService) {
    let storage: Arc<dyn StorageBackend> = Arc::new(InMemoryStorage::new());
    let ledger = LedgerService::new(storage.clone(), DeskSettings::default());
    for (id, name) in [("1", "Ali"), ("2", "Basheer"), ("8", "Tamiz"), ("9", "Jamil")] {
        ledger.register_staff(id, name).unwrap();
    }
    ledger.set_rates(rates()).unwrap();
    storage.adjust_balance("1", Currency::Home, dec!(1000000000)).unwrap();
    storage.adjust_balance("1", Currency::Primary, dec!(1000000000)).unwrap();
    (storage, ledger)
}

fn send_command(customer: String) -> SendMoneyCommand {
    SendMoneyCommand {
        staff_id: "1".to_string(),
        staff_name: None,
        customer_name: customer,
        amount_sent: dec!(500),
        received_money: dec!(22),
        received_currency: Currency::Primary,
        route: DeliveryRoute::PrimaryToSecondary,
        description: None,
        transaction_date: None,
    }
}

fn seed_transactions(ledger: &LedgerService) {
    for i in 0..500 {
        ledger.send_money(send_command(format!("Customer {}", i % 50))).unwrap();
    }
}

fn bench_conversion(c: &mut Criterion) {
    let rates = rates();
    c.bench_function("convert_home_to_primary", |b| {
        b.iter(|| convert(&rates, black_box(dec!(12345.67)), Currency::Home, Currency::Primary).unwrap())
    });
    c.bench_function("quote_composite_route", |b| {
        b.iter(|| {
            quote_send(
                &rates,
                DeliveryRoute::PrimaryToSecondary,
                black_box(dec!(12345.67)),
                black_box(dec!(100)),
                Currency::Secondary,
            )
            .unwrap()
        })
    });
}

fn bench_send_money(c: &mut Criterion) {
    let (_storage, ledger) = setup();
    seed_transactions(&ledger);

    c.bench_function("send_money", |b| {
        b.iter(|| ledger.send_money(black_box(send_command("Customer 7".to_string()))).unwrap())
    });
}

fn bench_transfer(c: &mut Criterion) {
    let (_storage, ledger) = setup();

    c.bench_function("staff_transfer", |b| {
        b.iter(|| {
            ledger
                .transfer(black_box(TransferCommand {
                    sender_id: "1".to_string(),
                    receiver_id: "2".to_string(),
                    amount: Decimal::ONE,
                    send_currency: Currency::Primary,
                    receive_currency: Currency::Secondary,
                    description: None,
                }))
                .unwrap()
        })
    });
}

fn bench_transactions_view(c: &mut Criterion) {
    let (storage, ledger) = setup();
    seed_transactions(&ledger);
    let queries = RecordQueries::new(storage, ledger.settings());

    c.bench_function("transactions_view", |b| b.iter(|| queries.transactions().unwrap()));
}

criterion_group!(benches, bench_conversion, bench_send_money, bench_transfer, bench_transactions_view);
criterion_main!(benches);
