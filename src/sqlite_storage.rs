use std::{
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard},
};

use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

use remitdesk_core::{
    Balances, CreateStaffCommand, Currency, CustomerTransaction, DeliveryRoute,
    NewCustomerTransaction, NewDeposit, NewExpense, NewTransfer, RateSet, Staff, StaffDeposit,
    StaffExpense, StaffTransfer,
};

use crate::storage::{StorageBackend, StorageError, TransactionGate, TransactionId};

pub struct SqliteStorage {
    conn: Mutex<Connection>,
    gate: TransactionGate,
}

impl SqliteStorage {
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(other)?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(other)?;

        let storage = Self {
            conn: Mutex::new(conn),
            gate: TransactionGate::new(),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS staff (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                balance_home TEXT NOT NULL DEFAULT '0',
                balance_primary TEXT NOT NULL DEFAULT '0',
                balance_secondary TEXT NOT NULL DEFAULT '0'
            );

            CREATE TABLE IF NOT EXISTS conversion_rates (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                primary_to_home TEXT NOT NULL,
                secondary_to_home TEXT NOT NULL,
                primary_to_secondary TEXT NOT NULL
            );

            INSERT OR IGNORE INTO conversion_rates (id, primary_to_home, secondary_to_home, primary_to_secondary)
                VALUES (1, '0', '0', '0');

            CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                sequence INTEGER NOT NULL,
                staff_id TEXT NOT NULL,
                staff_name TEXT,
                customer_name TEXT NOT NULL,
                amount_sent TEXT NOT NULL,
                received_money TEXT NOT NULL,
                received_currency TEXT NOT NULL,
                route TEXT NOT NULL,
                converted_home TEXT NOT NULL,
                converted_foreign TEXT NOT NULL,
                converted_currency TEXT NOT NULL,
                customer_balance_home TEXT NOT NULL,
                customer_balance_foreign TEXT NOT NULL,
                description TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_transactions_customer
                ON transactions(customer_name, sequence);

            CREATE TABLE IF NOT EXISTS staff_deposits (
                id TEXT PRIMARY KEY,
                sequence INTEGER NOT NULL,
                staff_id TEXT NOT NULL,
                staff_name TEXT,
                amount TEXT NOT NULL,
                currency TEXT NOT NULL,
                description TEXT NOT NULL,
                deposited_by TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_deposits_staff
                ON staff_deposits(staff_id, created_at);

            CREATE TABLE IF NOT EXISTS staff_expenses (
                id TEXT PRIMARY KEY,
                sequence INTEGER NOT NULL,
                staff_id TEXT NOT NULL,
                staff_name TEXT NOT NULL,
                amount TEXT NOT NULL,
                reason TEXT NOT NULL,
                currency TEXT NOT NULL,
                deducted_from TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS staff_transfers (
                id TEXT PRIMARY KEY,
                sequence INTEGER NOT NULL,
                sender_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                amount TEXT NOT NULL,
                currency TEXT NOT NULL,
                description TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sequence_counter (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                value INTEGER NOT NULL
            );

            INSERT OR IGNORE INTO sequence_counter (id, value) VALUES (1, 0);
            ",
        )
        .map_err(other)?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Other("sqlite connection lock poisoned".to_string()))
    }

    fn next_sequence(conn: &Connection) -> Result<u64, StorageError> {
        conn.execute(
            "UPDATE sequence_counter SET value = value + 1 WHERE id = 1",
            [],
        )
        .map_err(other)?;
        let seq: u64 = conn
            .query_row("SELECT value FROM sequence_counter WHERE id = 1", [], |r| {
                r.get(0)
            })
            .map_err(other)?;
        Ok(seq)
    }

    fn read_balance(conn: &Connection, staff_id: &str, currency: Currency) -> Result<Decimal, StorageError> {
        let sql = format!("SELECT {} FROM staff WHERE id = ?1", balance_column(currency));
        let raw: Option<String> = conn
            .query_row(&sql, params![staff_id], |row| row.get(0))
            .optional()
            .map_err(other)?;
        match raw {
            Some(raw) => decimal(&raw),
            None => Err(StorageError::StaffNotFound(staff_id.to_string())),
        }
    }

    fn adjusted_balance(conn: &Connection, staff_id: &str, currency: Currency, delta: Decimal) -> Result<Decimal, StorageError> {
        Self::read_balance(conn, staff_id, currency)?
            .checked_add(delta)
            .ok_or_else(|| StorageError::BalanceOverflow {
                staff_id: staff_id.to_string(),
                currency,
            })
    }

    fn write_balance(conn: &Connection, staff_id: &str, currency: Currency, balance: Decimal) -> Result<(), StorageError> {
        let sql = format!("UPDATE staff SET {} = ?1 WHERE id = ?2", balance_column(currency));
        let changed = conn
            .execute(&sql, params![balance.to_string(), staff_id])
            .map_err(other)?;
        if changed == 0 {
            return Err(StorageError::StaffNotFound(staff_id.to_string()));
        }
        Ok(())
    }
}

fn other(e: impl std::fmt::Display) -> StorageError {
    StorageError::Other(e.to_string())
}

fn balance_column(currency: Currency) -> &'static str {
    match currency {
        Currency::Home => "balance_home",
        Currency::Primary => "balance_primary",
        Currency::Secondary => "balance_secondary",
    }
}

fn decimal(raw: &str) -> Result<Decimal, StorageError> {
    Decimal::from_str(raw).map_err(|e| StorageError::Other(format!("Invalid decimal '{}': {}", raw, e)))
}

fn currency(raw: &str) -> Result<Currency, StorageError> {
    Currency::from_str(raw).map_err(StorageError::Other)
}

fn uuid(raw: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(raw).map_err(|e| StorageError::Other(format!("Invalid id '{}': {}", raw, e)))
}

/// Unix nanoseconds; instants outside what an `i64` holds are refused.
fn timestamp_to_db(at: OffsetDateTime) -> Result<i64, StorageError> {
    i64::try_from(at.unix_timestamp_nanos()).map_err(|_| StorageError::TimestampOutOfRange(at.to_string()))
}

fn timestamp_from_db(nanos: i64) -> Result<OffsetDateTime, StorageError> {
    OffsetDateTime::from_unix_timestamp_nanos(nanos as i128).map_err(other)
}

fn opt_arc(raw: Option<String>) -> Option<Arc<str>> {
    raw.map(|s| Arc::from(s.as_str()))
}

const TRANSACTION_COLUMNS: &str = "id, sequence, staff_id, staff_name, customer_name, amount_sent, received_money,
    received_currency, route, converted_home, converted_foreign, converted_currency,
    customer_balance_home, customer_balance_foreign, description, created_at";

struct TransactionRow {
    id: String,
    sequence: u64,
    staff_id: String,
    staff_name: Option<String>,
    customer_name: String,
    amount_sent: String,
    received_money: String,
    received_currency: String,
    route: String,
    converted_home: String,
    converted_foreign: String,
    converted_currency: String,
    customer_balance_home: String,
    customer_balance_foreign: String,
    description: String,
    created_at: i64,
}

impl TransactionRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            sequence: row.get(1)?,
            staff_id: row.get(2)?,
            staff_name: row.get(3)?,
            customer_name: row.get(4)?,
            amount_sent: row.get(5)?,
            received_money: row.get(6)?,
            received_currency: row.get(7)?,
            route: row.get(8)?,
            converted_home: row.get(9)?,
            converted_foreign: row.get(10)?,
            converted_currency: row.get(11)?,
            customer_balance_home: row.get(12)?,
            customer_balance_foreign: row.get(13)?,
            description: row.get(14)?,
            created_at: row.get(15)?,
        })
    }

    fn into_record(self) -> Result<CustomerTransaction, StorageError> {
        Ok(CustomerTransaction {
            id: uuid(&self.id)?,
            sequence: self.sequence,
            staff_id: Arc::from(self.staff_id.as_str()),
            staff_name: opt_arc(self.staff_name),
            customer_name: Arc::from(self.customer_name.as_str()),
            amount_sent: decimal(&self.amount_sent)?,
            received_money: decimal(&self.received_money)?,
            received_currency: currency(&self.received_currency)?,
            route: DeliveryRoute::from_str(&self.route).map_err(StorageError::Other)?,
            converted_home: decimal(&self.converted_home)?,
            converted_foreign: decimal(&self.converted_foreign)?,
            converted_currency: currency(&self.converted_currency)?,
            customer_balance_home: decimal(&self.customer_balance_home)?,
            customer_balance_foreign: decimal(&self.customer_balance_foreign)?,
            description: Arc::from(self.description.as_str()),
            created_at: timestamp_from_db(self.created_at)?,
        })
    }
}

const DEPOSIT_COLUMNS: &str = "id, sequence, staff_id, staff_name, amount, currency, description, deposited_by, created_at";
const DEPOSIT_COLUMNS_QUALIFIED: &str =
    "d.id, d.sequence, d.staff_id, d.staff_name, d.amount, d.currency, d.description, d.deposited_by, d.created_at";

struct DepositRow {
    id: String,
    sequence: u64,
    staff_id: String,
    staff_name: Option<String>,
    amount: String,
    currency: String,
    description: String,
    deposited_by: String,
    created_at: i64,
}

impl DepositRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            sequence: row.get(1)?,
            staff_id: row.get(2)?,
            staff_name: row.get(3)?,
            amount: row.get(4)?,
            currency: row.get(5)?,
            description: row.get(6)?,
            deposited_by: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<StaffDeposit, StorageError> {
        Ok(StaffDeposit {
            id: uuid(&self.id)?,
            sequence: self.sequence,
            staff_id: Arc::from(self.staff_id.as_str()),
            staff_name: opt_arc(self.staff_name),
            amount: decimal(&self.amount)?,
            currency: currency(&self.currency)?,
            description: Arc::from(self.description.as_str()),
            deposited_by: Arc::from(self.deposited_by.as_str()),
            created_at: timestamp_from_db(self.created_at)?,
        })
    }
}

const EXPENSE_COLUMNS: &str = "id, sequence, staff_id, staff_name, amount, reason, currency, deducted_from, created_at";

struct ExpenseRow {
    id: String,
    sequence: u64,
    staff_id: String,
    staff_name: String,
    amount: String,
    reason: String,
    currency: String,
    deducted_from: Option<String>,
    created_at: i64,
}

impl ExpenseRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            sequence: row.get(1)?,
            staff_id: row.get(2)?,
            staff_name: row.get(3)?,
            amount: row.get(4)?,
            reason: row.get(5)?,
            currency: row.get(6)?,
            deducted_from: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<StaffExpense, StorageError> {
        Ok(StaffExpense {
            id: uuid(&self.id)?,
            sequence: self.sequence,
            staff_id: Arc::from(self.staff_id.as_str()),
            staff_name: Arc::from(self.staff_name.as_str()),
            amount: decimal(&self.amount)?,
            reason: Arc::from(self.reason.as_str()),
            currency: currency(&self.currency)?,
            deducted_from: opt_arc(self.deducted_from),
            created_at: timestamp_from_db(self.created_at)?,
        })
    }
}

struct TransferRow {
    id: String,
    sequence: u64,
    sender_id: String,
    receiver_id: String,
    amount: String,
    currency: String,
    description: String,
    created_at: i64,
}

impl TransferRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            sequence: row.get(1)?,
            sender_id: row.get(2)?,
            receiver_id: row.get(3)?,
            amount: row.get(4)?,
            currency: row.get(5)?,
            description: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<StaffTransfer, StorageError> {
        Ok(StaffTransfer {
            id: uuid(&self.id)?,
            sequence: self.sequence,
            sender_id: Arc::from(self.sender_id.as_str()),
            receiver_id: Arc::from(self.receiver_id.as_str()),
            amount: decimal(&self.amount)?,
            currency: currency(&self.currency)?,
            description: Arc::from(self.description.as_str()),
            created_at: timestamp_from_db(self.created_at)?,
        })
    }
}

/// Substring pattern for `LIKE ... ESCAPE '\'`; wildcards in `fragment` match literally.
fn like_pattern(fragment: &str) -> String {
    let mut pattern = String::with_capacity(fragment.len() + 2);
    pattern.push('%');
    for c in fragment.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

impl StorageBackend for SqliteStorage {
    fn get_rates(&self) -> Result<RateSet, StorageError> {
        let conn = self.conn()?;
        let (p2h, s2h, p2s): (String, String, String) = conn
            .query_row(
                "SELECT primary_to_home, secondary_to_home, primary_to_secondary FROM conversion_rates WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(other)?;
        Ok(RateSet {
            primary_to_home: decimal(&p2h)?,
            secondary_to_home: decimal(&s2h)?,
            primary_to_secondary: decimal(&p2s)?,
        })
    }

    fn set_rates(&self, rates: &RateSet) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE conversion_rates SET primary_to_home = ?1, secondary_to_home = ?2, primary_to_secondary = ?3 WHERE id = 1",
            params![
                rates.primary_to_home.to_string(),
                rates.secondary_to_home.to_string(),
                rates.primary_to_secondary.to_string()
            ],
        )
        .map_err(other)?;
        Ok(())
    }

    fn create_staff(&self, command: &CreateStaffCommand) -> Result<(), StorageError> {
        let conn = self.conn()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO staff (id, name) VALUES (?1, ?2)",
                params![command.id.as_ref(), command.name.as_ref()],
            )
            .map_err(other)?;
        if inserted == 0 {
            return Err(StorageError::StaffAlreadyExists(command.id.to_string()));
        }
        Ok(())
    }

    fn get_staff(&self, staff_id: &str) -> Result<Staff, StorageError> {
        let conn = self.conn()?;
        let row: Option<(String, String, String, String, String)> = conn
            .query_row(
                "SELECT id, name, balance_home, balance_primary, balance_secondary FROM staff WHERE id = ?1",
                params![staff_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()
            .map_err(other)?;
        match row {
            Some(row) => staff_from_row(row),
            None => Err(StorageError::StaffNotFound(staff_id.to_string())),
        }
    }

    fn list_staff(&self) -> Result<Vec<Staff>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, name, balance_home, balance_primary, balance_secondary FROM staff ORDER BY id")
            .map_err(other)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)))
            .map_err(other)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(other)?;
        rows.into_iter().map(staff_from_row).collect()
    }

    fn delete_staff(&self, staff_id: &str) -> Result<(), StorageError> {
        let conn = self.conn()?;
        let removed = conn
            .execute("DELETE FROM staff WHERE id = ?1", params![staff_id])
            .map_err(other)?;
        if removed == 0 {
            return Err(StorageError::StaffNotFound(staff_id.to_string()));
        }
        Ok(())
    }

    fn lock_balance(&self, staff_id: &str, currency: Currency) -> Result<Decimal, StorageError> {
        // SQLite has no row locks; the open transaction holds the gate for us.
        let conn = self.conn()?;
        Self::read_balance(&conn, staff_id, currency)
    }

    fn set_balance(&self, staff_id: &str, currency: Currency, balance: Decimal) -> Result<(), StorageError> {
        let conn = self.conn()?;
        Self::write_balance(&conn, staff_id, currency, balance)
    }

    fn adjust_balance(&self, staff_id: &str, currency: Currency, delta: Decimal) -> Result<Decimal, StorageError> {
        let conn = self.conn()?;
        let balance = Self::adjusted_balance(&conn, staff_id, currency, delta)?;
        Self::write_balance(&conn, staff_id, currency, balance)?;
        Ok(balance)
    }

    fn adjust_balance_if_sufficient(&self, staff_id: &str, currency: Currency, delta: Decimal) -> Result<Option<Decimal>, StorageError> {
        let conn = self.conn()?;
        let balance = Self::adjusted_balance(&conn, staff_id, currency, delta)?;
        if balance < Decimal::ZERO {
            return Ok(None);
        }
        Self::write_balance(&conn, staff_id, currency, balance)?;
        Ok(Some(balance))
    }

    fn insert_transaction(&self, record: &NewCustomerTransaction) -> Result<CustomerTransaction, StorageError> {
        let created_at = timestamp_to_db(record.created_at)?;
        let conn = self.conn()?;
        let id = Uuid::new_v4();
        let seq = Self::next_sequence(&conn)?;
        conn.execute(
            &format!("INSERT INTO transactions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)", TRANSACTION_COLUMNS),
            params![
                id.to_string(),
                seq,
                record.staff_id.as_ref(),
                record.staff_name.as_deref(),
                record.customer_name.as_ref(),
                record.amount_sent.to_string(),
                record.received_money.to_string(),
                record.received_currency.key(),
                record.route.key(),
                record.converted_home.to_string(),
                record.converted_foreign.to_string(),
                record.converted_currency.key(),
                record.customer_balance_home.to_string(),
                record.customer_balance_foreign.to_string(),
                record.description.as_ref(),
                created_at,
            ],
        )
        .map_err(other)?;

        Ok(CustomerTransaction {
            id,
            sequence: seq,
            staff_id: record.staff_id.clone(),
            staff_name: record.staff_name.clone(),
            customer_name: record.customer_name.clone(),
            amount_sent: record.amount_sent,
            received_money: record.received_money,
            received_currency: record.received_currency,
            route: record.route,
            converted_home: record.converted_home,
            converted_foreign: record.converted_foreign,
            converted_currency: record.converted_currency,
            customer_balance_home: record.customer_balance_home,
            customer_balance_foreign: record.customer_balance_foreign,
            description: record.description.clone(),
            created_at: record.created_at,
        })
    }

    fn latest_customer_transaction(&self, customer_name: &str) -> Result<Option<CustomerTransaction>, StorageError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM transactions WHERE customer_name = ?1 ORDER BY sequence DESC LIMIT 1", TRANSACTION_COLUMNS),
                params![customer_name],
                TransactionRow::from_row,
            )
            .optional()
            .map_err(other)?;
        row.map(TransactionRow::into_record).transpose()
    }

    fn list_transactions(&self) -> Result<Vec<CustomerTransaction>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM transactions ORDER BY created_at ASC, sequence ASC", TRANSACTION_COLUMNS))
            .map_err(other)?;
        let rows = stmt
            .query_map([], TransactionRow::from_row)
            .map_err(other)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(other)?;
        rows.into_iter().map(TransactionRow::into_record).collect()
    }

    fn delete_transaction(&self, id: Uuid) -> Result<(), StorageError> {
        let conn = self.conn()?;
        let removed = conn
            .execute("DELETE FROM transactions WHERE id = ?1", params![id.to_string()])
            .map_err(other)?;
        if removed == 0 {
            return Err(StorageError::RecordNotFound(id.to_string()));
        }
        Ok(())
    }

    fn search_customers(&self, fragment: &str, limit: usize) -> Result<Vec<Arc<str>>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT customer_name FROM transactions WHERE customer_name LIKE ?1 ESCAPE '\\' ORDER BY customer_name LIMIT ?2")
            .map_err(other)?;
        let names = stmt
            .query_map(params![like_pattern(fragment), limit as i64], |row| row.get::<_, String>(0))
            .map_err(other)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(other)?;
        Ok(names.into_iter().map(|n| Arc::from(n.as_str())).collect())
    }

    fn insert_deposit(&self, record: &NewDeposit) -> Result<StaffDeposit, StorageError> {
        let created_at = timestamp_to_db(record.created_at)?;
        let conn = self.conn()?;
        let id = Uuid::new_v4();
        let seq = Self::next_sequence(&conn)?;
        conn.execute(
            &format!("INSERT INTO staff_deposits ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)", DEPOSIT_COLUMNS),
            params![
                id.to_string(),
                seq,
                record.staff_id.as_ref(),
                record.staff_name.as_deref(),
                record.amount.to_string(),
                record.currency.key(),
                record.description.as_ref(),
                record.deposited_by.as_ref(),
                created_at,
            ],
        )
        .map_err(other)?;

        Ok(StaffDeposit {
            id,
            sequence: seq,
            staff_id: record.staff_id.clone(),
            staff_name: record.staff_name.clone(),
            amount: record.amount,
            currency: record.currency,
            description: record.description.clone(),
            deposited_by: record.deposited_by.clone(),
            created_at: record.created_at,
        })
    }

    fn list_deposits(&self, staff_id: &str) -> Result<Vec<StaffDeposit>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM staff_deposits WHERE staff_id = ?1 ORDER BY created_at ASC, sequence ASC", DEPOSIT_COLUMNS))
            .map_err(other)?;
        let rows = stmt
            .query_map(params![staff_id], DepositRow::from_row)
            .map_err(other)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(other)?;
        rows.into_iter().map(DepositRow::into_record).collect()
    }

    fn search_deposits(&self, fragment: &str) -> Result<Vec<StaffDeposit>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM staff_deposits d LEFT JOIN staff s ON s.id = d.staff_id
                 WHERE d.id LIKE ?1 ESCAPE '\\'
                    OR COALESCE(s.name, d.staff_name) LIKE ?1 ESCAPE '\\'
                    OR d.description LIKE ?1 ESCAPE '\\'
                    OR d.deposited_by LIKE ?1 ESCAPE '\\'
                 ORDER BY d.created_at ASC, d.sequence ASC",
                DEPOSIT_COLUMNS_QUALIFIED
            ))
            .map_err(other)?;
        let rows = stmt
            .query_map(params![like_pattern(fragment)], DepositRow::from_row)
            .map_err(other)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(other)?;
        rows.into_iter().map(DepositRow::into_record).collect()
    }

    fn insert_expense(&self, record: &NewExpense) -> Result<StaffExpense, StorageError> {
        let created_at = timestamp_to_db(record.created_at)?;
        let conn = self.conn()?;
        let id = Uuid::new_v4();
        let seq = Self::next_sequence(&conn)?;
        conn.execute(
            &format!("INSERT INTO staff_expenses ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)", EXPENSE_COLUMNS),
            params![
                id.to_string(),
                seq,
                record.staff_id.as_ref(),
                record.staff_name.as_ref(),
                record.amount.to_string(),
                record.reason.as_ref(),
                record.currency.key(),
                record.deducted_from.as_deref(),
                created_at,
            ],
        )
        .map_err(other)?;

        Ok(StaffExpense {
            id,
            sequence: seq,
            staff_id: record.staff_id.clone(),
            staff_name: record.staff_name.clone(),
            amount: record.amount,
            reason: record.reason.clone(),
            currency: record.currency,
            deducted_from: record.deducted_from.clone(),
            created_at: record.created_at,
        })
    }

    fn list_expenses(&self, staff_name: &str) -> Result<Vec<StaffExpense>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM staff_expenses WHERE LOWER(staff_name) = LOWER(?1) ORDER BY created_at DESC, sequence DESC",
                EXPENSE_COLUMNS
            ))
            .map_err(other)?;
        let rows = stmt
            .query_map(params![staff_name], ExpenseRow::from_row)
            .map_err(other)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(other)?;
        rows.into_iter().map(ExpenseRow::into_record).collect()
    }

    fn insert_transfer(&self, record: &NewTransfer) -> Result<StaffTransfer, StorageError> {
        let created_at = timestamp_to_db(record.created_at)?;
        let conn = self.conn()?;
        let id = Uuid::new_v4();
        let seq = Self::next_sequence(&conn)?;
        conn.execute(
            "INSERT INTO staff_transfers (id, sequence, sender_id, receiver_id, amount, currency, description, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id.to_string(),
                seq,
                record.sender_id.as_ref(),
                record.receiver_id.as_ref(),
                record.amount.to_string(),
                record.currency.key(),
                record.description.as_ref(),
                created_at,
            ],
        )
        .map_err(other)?;

        Ok(StaffTransfer {
            id,
            sequence: seq,
            sender_id: record.sender_id.clone(),
            receiver_id: record.receiver_id.clone(),
            amount: record.amount,
            currency: record.currency,
            description: record.description.clone(),
            created_at: record.created_at,
        })
    }

    fn list_transfers(&self) -> Result<Vec<StaffTransfer>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, sequence, sender_id, receiver_id, amount, currency, description, created_at
                 FROM staff_transfers ORDER BY created_at ASC, sequence ASC",
            )
            .map_err(other)?;
        let rows = stmt
            .query_map([], TransferRow::from_row)
            .map_err(other)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(other)?;
        rows.into_iter().map(TransferRow::into_record).collect()
    }

    fn begin_transaction(&self) -> Result<TransactionId, StorageError> {
        let tx_id = self.gate.acquire()?;
        let started = self
            .conn()
            .and_then(|conn| conn.execute_batch("SAVEPOINT remitdesk_tx").map_err(other));
        if let Err(e) = started {
            self.gate.release(tx_id)?;
            return Err(e);
        }
        tracing::debug!(tx_id, "SQLite transaction started");
        Ok(tx_id)
    }

    fn commit_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        self.gate.check(tx_id)?;
        let committed = self.conn().and_then(|conn| {
            conn.execute_batch("RELEASE SAVEPOINT remitdesk_tx").map_err(|e| {
                // Leave the connection clean for the next transaction.
                let _ = conn.execute_batch("ROLLBACK TO SAVEPOINT remitdesk_tx; RELEASE SAVEPOINT remitdesk_tx");
                other(e)
            })
        });
        self.gate.release(tx_id)?;
        committed?;
        tracing::debug!(tx_id, "SQLite transaction committed");
        Ok(())
    }

    fn rollback_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        self.gate.check(tx_id)?;
        let rolled_back = self.conn().and_then(|conn| {
            conn.execute_batch("ROLLBACK TO SAVEPOINT remitdesk_tx; RELEASE SAVEPOINT remitdesk_tx")
                .map_err(other)
        });
        self.gate.release(tx_id)?;
        rolled_back?;
        tracing::debug!(tx_id, "SQLite transaction rolled back");
        Ok(())
    }

    fn begin_read(&self) -> Result<TransactionId, StorageError> {
        self.gate.acquire()
    }

    fn end_read(&self, read_id: TransactionId) -> Result<(), StorageError> {
        self.gate.release(read_id)
    }
}

fn staff_from_row(row: (String, String, String, String, String)) -> Result<Staff, StorageError> {
    let (id, name, home, primary, secondary) = row;
    Ok(Staff {
        id: Arc::from(id.as_str()),
        name: Arc::from(name.as_str()),
        balances: Balances {
            home: decimal(&home)?,
            primary: decimal(&primary)?,
            secondary: decimal(&secondary)?,
        },
    })
}
