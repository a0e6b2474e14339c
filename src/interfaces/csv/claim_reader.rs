use crate::domain::claim::{Address, Claim, ClaimStatus, ClaimType, ServiceLine};
use crate::domain::money::Money;
use crate::error::{PaymentProcessError, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

/// One CSV row: a claim header plus at most one of its service lines.
#[derive(Debug, Deserialize)]
struct ClaimRow {
    claim_id: String,
    parent_claim_id: String,
    #[serde(default)]
    original_claim_id: Option<String>,
    #[serde(default)]
    void_claim_id: Option<String>,
    claim_type: ClaimType,
    status: ClaimStatus,
    frequency_code: String,
    #[serde(default)]
    tax_id: Option<String>,
    #[serde(default)]
    npi: Option<String>,
    #[serde(default)]
    member_id: Option<String>,
    #[serde(default)]
    payee_name: Option<String>,
    #[serde(default)]
    address_line1: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    zip: Option<String>,
    #[serde(default)]
    benefit_plan_id: Option<String>,
    #[serde(default)]
    line_number: Option<u32>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    quantity: Option<Decimal>,
    #[serde(default)]
    billed_amount: Option<Decimal>,
    #[serde(default)]
    allowed_amount: Option<Decimal>,
}

impl ClaimRow {
    fn service_line(&mut self) -> Option<ServiceLine> {
        let line_number = self.line_number?;
        Some(ServiceLine {
            line_number,
            code: self.code.take().unwrap_or_default(),
            quantity: self.quantity.unwrap_or(Decimal::ONE),
            billed_amount: Money::new(self.billed_amount.unwrap_or_default()),
            allowed_amount: Money::new(self.allowed_amount.unwrap_or_default()),
        })
    }

    fn into_claim(mut self) -> Claim {
        let line = self.service_line();
        let payee_address = self.address_line1.take().map(|line1| Address {
            line1,
            city: self.city.take().unwrap_or_default(),
            state: self.state.take().unwrap_or_default(),
            zip: self.zip.take().unwrap_or_default(),
        });
        Claim {
            claim_id: self.claim_id,
            parent_claim_id: self.parent_claim_id,
            original_claim_id: self.original_claim_id,
            void_claim_id: self.void_claim_id,
            claim_type: self.claim_type,
            status: self.status,
            frequency_code: self.frequency_code,
            tax_id: self.tax_id,
            npi: self.npi,
            member_id: self.member_id,
            payee_name: self.payee_name,
            payee_address,
            benefit_plan_id: self.benefit_plan_id,
            service_lines: line.into_iter().collect(),
        }
    }
}

/// Reads claims from a CSV source with one row per service line.
///
/// Consecutive rows with the same `claim_id` and increasing `line_number`
/// belong to one claim. A repeated id whose line numbering restarts is read
/// as a separate claim, so duplicates reach validation instead of merging.
pub struct ClaimReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> ClaimReader<R> {
    /// Creates a new `ClaimReader` from any `Read` source (e.g., File, Stdin).
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Returns an iterator that lazily assembles claims from consecutive rows.
    ///
    /// A malformed row yields an error at its position and reading carries on
    /// with the next row.
    pub fn claims(self) -> impl Iterator<Item = Result<Claim>> {
        Claims {
            rows: self.reader.into_deserialize(),
            pending: None,
        }
    }
}

struct Claims<R: Read> {
    rows: csv::DeserializeRecordsIntoIter<R, ClaimRow>,
    pending: Option<Claim>,
}

impl<R: Read> Claims<R> {
    fn continues_pending(&self, row: &ClaimRow) -> bool {
        let Some(pending) = &self.pending else {
            return false;
        };
        if pending.claim_id != row.claim_id {
            return false;
        }
        match (pending.service_lines.last(), row.line_number) {
            (Some(last), Some(next)) => next > last.line_number,
            (None, Some(_)) => true,
            _ => false,
        }
    }
}

impl<R: Read> Iterator for Claims<R> {
    type Item = Result<Claim>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let mut row = match self.rows.next() {
                Some(Ok(row)) => row,
                Some(Err(e)) => return Some(Err(PaymentProcessError::from(e))),
                None => return self.pending.take().map(Ok),
            };
            if self.continues_pending(&row) {
                if let (Some(pending), Some(line)) = (self.pending.as_mut(), row.service_line()) {
                    pending.service_lines.push(line);
                }
                continue;
            }
            if let Some(done) = self.pending.replace(row.into_claim()) {
                return Some(Ok(done));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const HEADER: &str = "claim_id,parent_claim_id,original_claim_id,void_claim_id,claim_type,status,frequency_code,tax_id,npi,member_id,payee_name,benefit_plan_id,line_number,code,quantity,billed_amount,allowed_amount";

    #[test]
    fn test_reader_groups_lines_per_claim() {
        let data = format!(
            "{HEADER}\n\
             C1, P1, , , Paid, Approved, 1, 11-1, 99, M1, Clinic, PLAN-A, 1, 99213, 1, 120.00, 100.00\n\
             C1, P1, , , Paid, Approved, 1, 11-1, 99, M1, Clinic, PLAN-A, 2, 99214, 1, 60.00, 50.00\n\
             C2, P1, C1, , Adjust, Approved, 7, 11-1, 99, M1, Clinic, PLAN-A, 1, 99213, 1, 0, -20.00"
        );
        let claims: Vec<Claim> = ClaimReader::new(data.as_bytes())
            .claims()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(claims.len(), 2);
        assert_eq!(claims[0].service_lines.len(), 2);
        assert_eq!(claims[0].service_lines[1].allowed_amount, Money::new(dec!(50.00)));
        assert_eq!(claims[1].claim_type, ClaimType::Adjust);
        assert_eq!(claims[1].original_claim_id.as_deref(), Some("C1"));
        assert_eq!(claims[1].void_claim_id, None);
    }

    #[test]
    fn test_reader_splits_repeated_claim_id() {
        let data = format!(
            "{HEADER}\n\
             C1, P1, , , Paid, Approved, 1, 11-1, 99, , , PLAN-A, 1, 99213, 1, 10, 10\n\
             C1, P1, , , Paid, Approved, 1, 11-1, 99, , , PLAN-A, 1, 99213, 1, 10, 10"
        );
        let claims: Vec<Claim> = ClaimReader::new(data.as_bytes())
            .claims()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(claims.len(), 2);
        assert!(claims.iter().all(|c| c.claim_id == "C1"));
    }

    #[test]
    fn test_reader_malformed_line() {
        let data = format!(
            "{HEADER}\n\
             C1, P1, , , Refund, Approved, 1, 11-1, 99, , , PLAN-A, 1, 99213, 1, 10, 10\n\
             C2, P2, , , Paid, Approved, 1, 11-1, 99, , , PLAN-A, 1, 99213, 1, 10, 10"
        );
        let results: Vec<Result<Claim>> = ClaimReader::new(data.as_bytes()).claims().collect();

        assert_eq!(results.len(), 2);
        assert!(results[0].is_err());
        assert_eq!(results[1].as_ref().unwrap().claim_id, "C2");
    }
}
