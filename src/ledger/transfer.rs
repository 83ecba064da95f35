use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;

use remitdesk_core::{Currency, NewDeposit, NewTransfer, StaffTransfer};

use super::{positive, required, track, LedgerError, LedgerResult, LedgerService, Outcome};
use crate::conversion::convert;

#[derive(Debug, Clone, PartialEq)]
pub struct TransferCommand {
    pub sender_id: String,
    pub receiver_id: String,
    /// In `send_currency`.
    pub amount: Decimal,
    pub send_currency: Currency,
    pub receive_currency: Currency,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferReceipt {
    pub transfer: StaffTransfer,
    pub converted_amount: Decimal,
    pub receive_currency: Currency,
    pub sender_balance: Decimal,
    pub receiver_balance: Decimal,
}

impl LedgerService {
    /// Moves money between two staff in one unit of work. The sender's debit is
    /// guarded: it never takes the send-currency balance below zero.
    pub fn transfer(&self, command: TransferCommand) -> LedgerResult<TransferReceipt> {
        let result = (|| -> LedgerResult<TransferReceipt> {
            let sender_id = required(&command.sender_id, "senderId")?;
            let receiver_id = required(&command.receiver_id, "receiverId")?;
            let amount = positive(command.amount, "amount")?;
            if sender_id == receiver_id {
                return Err(LedgerError::Validation("Sender and receiver cannot be same".to_string()));
            }
            let send = command.send_currency;
            let receive = command.receive_currency;

            let receipt = self.unit_of_work("transfer", |storage| {
                let sender = storage.get_staff(sender_id)?;
                let receiver = storage.get_staff(receiver_id)?;

                let converted = if send == receive {
                    amount
                } else {
                    convert(&storage.get_rates()?, amount, send, receive)?
                };

                let sender_balance = storage
                    .adjust_balance_if_sufficient(&sender.id, send, -amount)?
                    .ok_or_else(|| LedgerError::InsufficientBalance {
                        staff_id: sender.id.to_string(),
                        currency: send,
                    })?;
                let receiver_balance = storage.adjust_balance(&receiver.id, receive, converted)?;

                let codes = &self.settings.currencies;
                let description: Arc<str> = match command.description.as_deref().map(str::trim) {
                    Some(d) if !d.is_empty() => Arc::from(d),
                    _ => Arc::from(
                        format!(
                            "Transfer {} {} from {} -> {} ({:.6} {})",
                            amount,
                            codes.code(send),
                            sender.name,
                            receiver.name,
                            converted,
                            codes.code(receive)
                        )
                        .as_str(),
                    ),
                };
                let created_at = OffsetDateTime::now_utc();

                let transfer = storage.insert_transfer(&NewTransfer {
                    sender_id: sender.id.clone(),
                    receiver_id: receiver.id.clone(),
                    amount,
                    currency: send,
                    description: description.clone(),
                    created_at,
                })?;

                storage.insert_deposit(&NewDeposit {
                    staff_id: receiver.id.clone(),
                    staff_name: Some(receiver.name.clone()),
                    amount: converted,
                    currency: receive,
                    description,
                    deposited_by: sender.name.clone(),
                    created_at,
                })?;
                storage.insert_deposit(&NewDeposit {
                    staff_id: sender.id.clone(),
                    staff_name: Some(sender.name.clone()),
                    amount: -amount,
                    currency: send,
                    description: Arc::from(
                        format!(
                            "Sent {} {} to {} ({:.6} {})",
                            amount,
                            codes.code(send),
                            receiver.name,
                            converted,
                            codes.code(receive)
                        )
                        .as_str(),
                    ),
                    deposited_by: sender.name.clone(),
                    created_at,
                })?;

                Ok(TransferReceipt {
                    transfer,
                    converted_amount: converted,
                    receive_currency: receive,
                    sender_balance,
                    receiver_balance,
                })
            })?;

            tracing::info!(
                sender_id = %receipt.transfer.sender_id,
                receiver_id = %receipt.transfer.receiver_id,
                amount = %amount,
                send_currency = %send,
                converted = %receipt.converted_amount,
                receive_currency = %receive,
                "Staff transfer recorded"
            );
            Ok(Outcome::committed(receipt, "Staff to staff transaction successful"))
        })();
        track("transfer", result)
    }
}
