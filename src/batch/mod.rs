use tracing::{dispatcher, error, info, Dispatch};

use crate::error::BatchError;
use crate::ledger::LedgerClient;
use crate::row::{RowProcessor, RowReport, RowState};
use crate::sheet::{RowStore, Worksheet};

#[derive(Debug, Default)]
pub struct RunSummary {
    pub processed: usize,
    pub skipped: usize,
    pub recorded: usize,
    pub failed: usize,
    pub reports: Vec<RowReport>,
}

impl RunSummary {
    fn push(&mut self, report: RowReport) {
        self.processed += 1;
        match report.state {
            RowState::Skipped => self.skipped += 1,
            RowState::Recorded { .. } => self.recorded += 1,
            RowState::Failed { .. } => self.failed += 1,
        }
        self.reports.push(report);
    }
}

/// Walks fetched rows one at a time. Rows are never processed concurrently:
/// every push comes from the same operator and must get the next nonce.
pub struct BatchRunner<L, S> {
    processor: RowProcessor<L>,
    sheet: Worksheet<S>,
    dispatch: Dispatch,
}

impl<L: LedgerClient, S: RowStore> BatchRunner<L, S> {
    /// Events are emitted to `dispatch` rather than the process default.
    pub fn new(processor: RowProcessor<L>, sheet: Worksheet<S>, dispatch: Dispatch) -> Self {
        Self {
            processor,
            sheet,
            dispatch,
        }
    }

    pub fn sheet(&self) -> &Worksheet<S> {
        &self.sheet
    }

    pub fn run<I>(&mut self, rows: I) -> Result<RunSummary, BatchError>
    where
        I: IntoIterator<Item = Vec<String>>,
    {
        let dispatch = self.dispatch.clone();
        dispatcher::with_default(&dispatch, || self.run_rows(rows))
    }

    fn run_rows<I>(&mut self, rows: I) -> Result<RunSummary, BatchError>
    where
        I: IntoIterator<Item = Vec<String>>,
    {
        let mut summary = RunSummary::default();
        for (index, cells) in rows.into_iter().enumerate() {
            let report = match self.processor.process(index, cells, &mut self.sheet) {
                Ok(report) => report,
                Err(err) => {
                    error!(
                        row = index,
                        error = %err,
                        recorded = summary.recorded,
                        failed = summary.failed,
                        "halting run"
                    );
                    return Err(err);
                }
            };
            match &report.state {
                RowState::Skipped => info!(row = index, state = "skipped", "outcome already recorded"),
                RowState::Recorded { receipt } => {
                    info!(row = index, state = "recorded", outcome = %receipt.cid, "grant pushed")
                }
                RowState::Failed { stage, error } => info!(
                    row = index,
                    state = "failed",
                    stage = %stage,
                    kind = error.kind(),
                    outcome = %error,
                    "grant failed"
                ),
            }
            summary.push(report);
        }
        info!(
            processed = summary.processed,
            recorded = summary.recorded,
            failed = summary.failed,
            skipped = summary.skipped,
            "run complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::address::resolve;
    use crate::error::RowError;
    use crate::grant::{AddVerifiedClientParams, Allowance, AllowancePolicy, GrantRequestBuilder, Message};
    use crate::ledger::{GrantSubmitter, LedgerError, Receipt};
    use crate::retry::RetryPolicy;
    use crate::row::Stage;
    use crate::sheet::{SheetLayout, StoreError};

    const SECP: &str = "f17uoq6tp427uzv7fztkbsnn64iwotfrristwpryy";
    const ETH: &str = "0xAbCdEf0123456789ABCDEF0123456789abcdef01";

    #[derive(Default)]
    struct StubLedger {
        pushed: Vec<Message>,
        in_flight: usize,
        max_in_flight: usize,
        reject: Option<LedgerError>,
    }

    impl LedgerClient for StubLedger {
        fn push_message(&mut self, msg: &Message) -> Result<Receipt, LedgerError> {
            self.in_flight += 1;
            self.max_in_flight = self.max_in_flight.max(self.in_flight);
            self.pushed.push(msg.clone());
            self.in_flight -= 1;
            if let Some(err) = self.reject.take() {
                return Err(err);
            }
            Ok(Receipt {
                cid: format!("bafy2bzace{}", self.pushed.len()),
                nonce: Some(self.pushed.len() as u64 - 1),
            })
        }
    }

    #[derive(Default)]
    struct StubStore {
        updates: Vec<(String, String, String)>,
        attempts: usize,
        failures: Vec<StoreError>,
    }

    impl RowStore for StubStore {
        fn fetch_rows(&mut self, _: &str, _: &str) -> Result<Vec<Vec<String>>, StoreError> {
            Ok(Vec::new())
        }

        fn update_cell(&mut self, source: &str, cell: &str, value: &str) -> Result<(), StoreError> {
            self.attempts += 1;
            if !self.failures.is_empty() {
                return Err(self.failures.remove(0));
            }
            self.updates.push((source.into(), cell.into(), value.into()));
            Ok(())
        }
    }

    fn rows(rows: &[&[&str]]) -> Vec<Vec<String>> {
        rows.iter()
            .map(|row| row.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    fn runner<'a>(
        ledger: &'a mut StubLedger,
        store: &'a mut StubStore,
        policy: AllowancePolicy,
    ) -> BatchRunner<&'a mut StubLedger, &'a mut StubStore> {
        let operator = resolve("f01000").unwrap();
        let processor = RowProcessor::new(
            GrantRequestBuilder::new(operator),
            GrantSubmitter::new(ledger, RetryPolicy::none()),
            policy,
        );
        let sheet = Worksheet::new(store, "sheet-id", SheetLayout::default(), RetryPolicy::new(3, 1, 1, 0.0));
        BatchRunner::new(processor, sheet, Dispatch::none())
    }

    fn params_for(identity: &str, mib: u64) -> Vec<u8> {
        AddVerifiedClientParams {
            address: resolve(identity).unwrap(),
            allowance: Allowance::from_mib(mib),
        }
        .to_cbor()
        .unwrap()
    }

    #[test]
    fn every_pending_row_gets_its_cid_written_back_in_order() {
        let mut ledger = StubLedger::default();
        let mut store = StubStore::default();
        let summary = runner(&mut ledger, &mut store, AllowancePolicy::Permissive)
            .run(rows(&[&["t1", SECP, "5"], &["t2", ETH, "10"]]))
            .unwrap();

        assert_eq!(summary.recorded, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(ledger.pushed.len(), 2);
        assert_eq!(ledger.max_in_flight, 1);
        assert_eq!(ledger.pushed[0].params, params_for(SECP, 5));
        assert_eq!(ledger.pushed[1].params, params_for(ETH, 10));
        assert!(ledger.pushed.iter().all(|m| m.from == resolve("f01000").unwrap()));
        assert_eq!(
            store.updates,
            vec![
                ("sheet-id".into(), "Form Responses 1!D2".into(), "bafy2bzace1".into()),
                ("sheet-id".into(), "Form Responses 1!D3".into(), "bafy2bzace2".into()),
            ]
        );
    }

    #[test]
    fn bad_identity_writes_resolver_error_and_run_continues() {
        let mut ledger = StubLedger::default();
        let mut store = StubStore::default();
        let summary = runner(&mut ledger, &mut store, AllowancePolicy::Permissive)
            .run(rows(&[&["t1", "not-an-address", "5"], &["t2", "f0100", "1"]]))
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.recorded, 1);
        assert_eq!(ledger.pushed.len(), 1);
        assert_eq!(store.updates[0].1, "Form Responses 1!D2");
        assert_eq!(store.updates[0].2, "unknown address network");
        assert_eq!(store.updates[1].2, "bafy2bzace1");
        match &summary.reports[0].state {
            RowState::Failed { stage, error } => {
                assert_eq!(*stage, Stage::Validated);
                assert!(matches!(error, RowError::InvalidIdentity(_)));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn processed_rows_are_never_resubmitted_or_rewritten() {
        let mut ledger = StubLedger::default();
        let mut store = StubStore::default();
        let summary = runner(&mut ledger, &mut store, AllowancePolicy::Permissive)
            .run(rows(&[&["t1", "not-an-address", "5", "bafy-old"], &["t2", "f0100", "1"]]))
            .unwrap();

        assert_eq!(summary.skipped, 1);
        assert!(matches!(summary.reports[0].state, RowState::Skipped));
        assert_eq!(summary.reports[0].cell, None);
        assert_eq!(ledger.pushed.len(), 1);
        assert_eq!(store.updates.len(), 1);
        assert_eq!(store.updates[0].1, "Form Responses 1!D3");
    }

    #[test]
    fn short_row_is_recorded_as_malformed() {
        let mut ledger = StubLedger::default();
        let mut store = StubStore::default();
        let summary = runner(&mut ledger, &mut store, AllowancePolicy::Permissive)
            .run(rows(&[&["t1", "f0100"]]))
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert!(ledger.pushed.is_empty());
        assert_eq!(
            store.updates[0].2,
            "malformed row: expected at least 3 cells, found 2"
        );
        match &summary.reports[0].state {
            RowState::Failed { stage, error } => {
                assert_eq!(*stage, Stage::Validated);
                assert_eq!(error.kind(), "malformed_row");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn permissive_policy_pushes_zero_allowance() {
        let mut ledger = StubLedger::default();
        let mut store = StubStore::default();
        runner(&mut ledger, &mut store, AllowancePolicy::Permissive)
            .run(rows(&[&["t1", "f0100", "abc"]]))
            .unwrap();

        assert_eq!(ledger.pushed.len(), 1);
        assert_eq!(ledger.pushed[0].params, params_for("f0100", 0));
    }

    #[test]
    fn strict_policy_fails_row_without_pushing() {
        let mut ledger = StubLedger::default();
        let mut store = StubStore::default();
        let summary = runner(&mut ledger, &mut store, AllowancePolicy::Strict)
            .run(rows(&[&["t1", "f0100", "abc"], &["t2", "f0100", "2"]]))
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(ledger.pushed.len(), 1);
        assert_eq!(ledger.pushed[0].params, params_for("f0100", 2));
        assert_eq!(
            store.updates[0].2,
            "invalid allowance \"abc\": expected a whole number of MiB"
        );
    }

    #[test]
    fn node_rejection_is_recorded_and_run_continues() {
        let mut ledger = StubLedger {
            reject: Some(LedgerError::Rpc {
                code: 1,
                message: "mpool push: not enough funds".into(),
            }),
            ..Default::default()
        };
        let mut store = StubStore::default();
        let summary = runner(&mut ledger, &mut store, AllowancePolicy::Permissive)
            .run(rows(&[&["t1", "f0100", "1"], &["t2", "f0101", "1"]]))
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.recorded, 1);
        assert_eq!(store.updates[0].2, "mpool push: not enough funds (code 1)");
        assert_eq!(store.updates[1].2, "bafy2bzace2");
    }

    #[test]
    fn failed_write_back_halts_the_run() {
        let mut ledger = StubLedger::default();
        let mut store = StubStore {
            failures: vec![StoreError::Status {
                status: 403,
                body: "forbidden".into(),
            }],
            ..Default::default()
        };
        let err = runner(&mut ledger, &mut store, AllowancePolicy::Permissive)
            .run(rows(&[&["t1", "f0100", "1"], &["t2", "f0101", "1"]]))
            .unwrap_err();

        match err {
            BatchError::WriteBack { cell, source } => {
                assert_eq!(cell, "Form Responses 1!D2");
                assert!(matches!(source, StoreError::Status { status: 403, .. }));
            }
            other => panic!("expected write-back failure, got {other:?}"),
        }
        assert_eq!(ledger.pushed.len(), 1);
        assert_eq!(store.attempts, 1);
        assert!(store.updates.is_empty());
    }

    #[test]
    fn transient_write_back_failures_are_retried_before_halting() {
        let mut ledger = StubLedger::default();
        let mut store = StubStore {
            failures: vec![
                StoreError::Transport("reset".into()),
                StoreError::Status {
                    status: 503,
                    body: String::new(),
                },
            ],
            ..Default::default()
        };
        let summary = runner(&mut ledger, &mut store, AllowancePolicy::Permissive)
            .run(rows(&[&["t1", "f0100", "1"]]))
            .unwrap();

        assert_eq!(summary.recorded, 1);
        assert_eq!(store.attempts, 3);
        assert_eq!(store.updates.len(), 1);

        let mut ledger = StubLedger::default();
        let mut store = StubStore {
            failures: vec![StoreError::Transport("reset".into()); 3],
            ..Default::default()
        };
        let err = runner(&mut ledger, &mut store, AllowancePolicy::Permissive)
            .run(rows(&[&["t1", "f0100", "1"], &["t2", "f0101", "1"]]))
            .unwrap_err();
        assert!(matches!(err, BatchError::WriteBack { .. }));
        assert_eq!(store.attempts, 3);
        assert_eq!(ledger.pushed.len(), 1);
    }

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLog {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn events_go_to_the_injected_subscriber() {
        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        let mut ledger = StubLedger::default();
        let mut store = StubStore::default();
        let operator = resolve("f01000").unwrap();
        let processor = RowProcessor::new(
            GrantRequestBuilder::new(operator),
            GrantSubmitter::new(&mut ledger, RetryPolicy::none()),
            AllowancePolicy::Permissive,
        );
        let sheet = Worksheet::new(&mut store, "sheet-id", SheetLayout::default(), RetryPolicy::none());
        let mut runner = BatchRunner::new(processor, sheet, Dispatch::new(subscriber));
        let summary = runner.run(rows(&[&["t1", "f0100", "1"]])).unwrap();
        assert_eq!(summary.recorded, 1);
        assert_eq!(runner.sheet().store().updates.len(), 1);

        let text = log.text();
        assert!(text.contains("grant pushed"), "{text}");
        assert!(text.contains("row=0"), "{text}");
        assert!(text.contains("run complete"), "{text}");
    }

    #[test]
    fn runs_without_a_subscriber_emit_nothing_to_other_dispatchers() {
        let log = CapturedLog::default();
        let writer = log.clone();
        let outer = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let mut ledger = StubLedger::default();
        let mut store = StubStore::default();
        tracing::subscriber::with_default(outer, || {
            runner(&mut ledger, &mut store, AllowancePolicy::Permissive)
                .run(rows(&[&["t1", "f0100", "1"]]))
                .unwrap();
        });
        assert!(log.text().is_empty(), "{}", log.text());
    }
}
