//! PostgreSQL invoice store.
//!
//! Runtime queries only (no compile-time checking macros) so the crate
//! builds without a live database. Schema lives in `sql/schema.sql`.
//! Payment appends rely on `ON CONFLICT DO NOTHING` against the
//! `(invoice_id, txid, vout)` primary key, which makes them idempotent at
//! the database level even if two processes race.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Row, postgres::PgRow};

use super::{
    Invoice, InvoiceStatus, InvoiceStore, Payment, PaymentKind, PaymentPrompt, SpeedPolicy,
    StoreError,
};
use crate::core_types::{Address, InvoiceId, NetworkId, OutPoint, ScriptHash, TxId};

pub struct PgInvoiceStore {
    pool: PgPool,
}

impl PgInvoiceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Register an invoice (creation itself is outside the engine).
    pub async fn insert(&self, invoice: &Invoice) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"INSERT INTO invoices_tb
               (invoice_id, status, speed_policy, network, prompt_address, prompt_script,
                prompt_due, pending)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               ON CONFLICT (invoice_id) DO NOTHING"#,
        )
        .bind(&invoice.id.0)
        .bind(invoice.status.as_str())
        .bind(invoice.speed_policy.as_str())
        .bind(&invoice.prompt.network.0)
        .bind(&invoice.prompt.address.0)
        .bind(&invoice.prompt.script.0)
        .bind(invoice.prompt.due)
        .bind(matches!(
            invoice.status,
            InvoiceStatus::New | InvoiceStatus::Processing
        ))
        .execute(&mut *tx)
        .await?;

        for script in &invoice.tracked_scripts {
            sqlx::query(
                r#"INSERT INTO invoice_scripts_tb (script, invoice_id)
                   VALUES ($1, $2)
                   ON CONFLICT (script) DO NOTHING"#,
            )
            .bind(&script.0)
            .bind(&invoice.id.0)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_invoice(&self, id: &InvoiceId) -> Result<Option<Invoice>, StoreError> {
        let row = sqlx::query(
            r#"SELECT invoice_id, status, speed_policy, network, prompt_address, prompt_script,
                      prompt_due
               FROM invoices_tb WHERE invoice_id = $1"#,
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let network = NetworkId::new(row.get::<String, _>("network"));
        let prompt = PaymentPrompt {
            address: Address::new(row.get::<String, _>("prompt_address")),
            script: ScriptHash(row.get::<String, _>("prompt_script")),
            network,
            due: row.get::<Decimal, _>("prompt_due"),
        };

        let scripts = sqlx::query(r#"SELECT script FROM invoice_scripts_tb WHERE invoice_id = $1"#)
            .bind(&id.0)
            .fetch_all(&self.pool)
            .await?;

        let payments = sqlx::query(
            r#"SELECT txid, vout, network, value, confirmations, accounted, rbf,
                      destination, kind, received_at
               FROM payments_tb WHERE invoice_id = $1
               ORDER BY received_at ASC"#,
        )
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(Invoice {
            id: id.clone(),
            status: InvoiceStatus::parse(&row.get::<String, _>("status"))?,
            speed_policy: SpeedPolicy::parse(&row.get::<String, _>("speed_policy"))?,
            tracked_scripts: scripts
                .into_iter()
                .map(|r| ScriptHash(r.get::<String, _>("script")))
                .collect(),
            prompt,
            payments: payments
                .into_iter()
                .map(payment_from_row)
                .collect::<Result<Vec<_>, _>>()?,
        }))
    }
}

fn payment_from_row(row: PgRow) -> Result<Payment, StoreError> {
    let kind_json: String = row.get("kind");
    let kind: PaymentKind = serde_json::from_str(&kind_json)
        .map_err(|e| StoreError::Decode(format!("payment kind: {}", e)))?;
    Ok(Payment {
        outpoint: OutPoint {
            txid: TxId::new(row.get::<String, _>("txid")),
            vout: row.get::<i32, _>("vout") as u32,
        },
        network: NetworkId::new(row.get::<String, _>("network")),
        value: row.get::<Decimal, _>("value"),
        confirmations: row.get::<i32, _>("confirmations"),
        accounted: row.get::<bool, _>("accounted"),
        rbf: row.get::<bool, _>("rbf"),
        destination: ScriptHash(row.get::<String, _>("destination")),
        kind,
        received_at: row.get::<DateTime<Utc>, _>("received_at"),
    })
}

fn kind_to_json(kind: &PaymentKind) -> Result<String, StoreError> {
    serde_json::to_string(kind).map_err(|e| StoreError::Decode(format!("payment kind: {}", e)))
}

#[async_trait]
impl InvoiceStore for PgInvoiceStore {
    async fn get(&self, id: &InvoiceId) -> Result<Option<Invoice>, StoreError> {
        self.load_invoice(id).await
    }

    async fn find_by_script(&self, script: &ScriptHash) -> Result<Option<Invoice>, StoreError> {
        let row = sqlx::query(r#"SELECT invoice_id FROM invoice_scripts_tb WHERE script = $1"#)
            .bind(&script.0)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        self.load_invoice(&InvoiceId::new(row.get::<String, _>("invoice_id")))
            .await
    }

    async fn pending_invoices(&self, network: &NetworkId) -> Result<Vec<Invoice>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT invoice_id FROM invoices_tb
               WHERE pending AND network = $1
               ORDER BY invoice_id"#,
        )
        .bind(&network.0)
        .fetch_all(&self.pool)
        .await?;

        // One query per invoice; the pending set is small by construction
        // (invoices leave it once fully confirmed).
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id = InvoiceId::new(row.get::<String, _>("invoice_id"));
            if let Some(invoice) = self.load_invoice(&id).await? {
                out.push(invoice);
            }
        }
        Ok(out)
    }

    async fn append_payment(&self, id: &InvoiceId, payment: &Payment) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"INSERT INTO payments_tb
               (invoice_id, txid, vout, network, value, confirmations, accounted, rbf,
                destination, kind, received_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
               ON CONFLICT (invoice_id, txid, vout) DO NOTHING"#,
        )
        .bind(&id.0)
        .bind(&payment.outpoint.txid.0)
        .bind(payment.outpoint.vout as i32)
        .bind(&payment.network.0)
        .bind(payment.value)
        .bind(payment.confirmations)
        .bind(payment.accounted)
        .bind(payment.rbf)
        .bind(&payment.destination.0)
        .bind(kind_to_json(&payment.kind)?)
        .bind(payment.received_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_payments(
        &self,
        id: &InvoiceId,
        payments: &[Payment],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for payment in payments {
            sqlx::query(
                r#"UPDATE payments_tb
                   SET confirmations = $1, accounted = $2, kind = $3
                   WHERE invoice_id = $4 AND txid = $5 AND vout = $6"#,
            )
            .bind(payment.confirmations)
            .bind(payment.accounted)
            .bind(kind_to_json(&payment.kind)?)
            .bind(&id.0)
            .bind(&payment.outpoint.txid.0)
            .bind(payment.outpoint.vout as i32)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn set_pending(&self, id: &InvoiceId, pending: bool) -> Result<(), StoreError> {
        sqlx::query(r#"UPDATE invoices_tb SET pending = $1 WHERE invoice_id = $2"#)
            .bind(pending)
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn rotate_prompt(
        &self,
        id: &InvoiceId,
        address: &Address,
        script: &ScriptHash,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"UPDATE invoices_tb SET prompt_address = $1, prompt_script = $2
               WHERE invoice_id = $3"#,
        )
        .bind(&address.0)
        .bind(&script.0)
        .bind(&id.0)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"INSERT INTO invoice_scripts_tb (script, invoice_id)
               VALUES ($1, $2)
               ON CONFLICT (script) DO NOTHING"#,
        )
        .bind(&script.0)
        .bind(&id.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}
