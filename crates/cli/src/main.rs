//! Walk-through binary: runs a receipt, an issue, a transfer and a count
//! against the in-memory engine and prints the resulting onhand as JSON.

use std::sync::Arc;

use anyhow::{Context, bail};
use serde_json::{Value as JsonValue, json};

use stockflow_core::{LocationCode, ModelCode, SystemClock, UserId, WarehouseCode};
use stockflow_events::{EventEnvelope, InMemoryEventBus};
use stockflow_infra::{
    EngineConfig, InMemoryDocumentRepository, InMemoryOnhandLedger, InventoryEngine,
};
use stockflow_inventory::{
    CountEntry, DocEvent, DocStatus, DocType, Document, DocumentHeader, LineInput, TrackingType,
};

type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
type Engine = InventoryEngine<InMemoryDocumentRepository, InMemoryOnhandLedger, Bus>;

fn main() -> anyhow::Result<()> {
    stockflow_observability::init();

    let config = EngineConfig::from_env();
    tracing::info!(?config, "starting stockflow walk-through");

    let engine: Engine = InventoryEngine::new(
        InMemoryDocumentRepository::new(),
        InMemoryOnhandLedger::new(config.ledger_lock_timeout),
        Arc::new(InMemoryEventBus::new()),
        Arc::new(SystemClock),
        config,
    );
    let user = UserId::new();

    let main_wh = WarehouseCode::parse("WH-MAIN")?;
    let store_wh = WarehouseCode::parse("WH-STORE")?;
    let bin = LocationCode::parse("A-01")?;
    let widget = ModelCode::parse("WIDGET")?;
    let source = DocumentHeader::new(main_wh.clone(), bin.clone());

    let gr = engine.create_document(
        DocType::GoodsReceipt,
        source.clone().with_reference("PO-1001"),
        vec![LineInput::new(widget.clone(), "EA", TrackingType::None, 100)],
        user,
    )?;
    run(&engine, &gr, &[DocEvent::StartReceiving, DocEvent::Submit, DocEvent::Confirm], user)?;

    let gi = engine.create_document(
        DocType::GoodsIssue,
        source.clone().with_reference("SO-2001"),
        vec![LineInput::new(widget.clone(), "EA", TrackingType::None, 30)],
        user,
    )?;
    run(&engine, &gi, &[DocEvent::StartPicking, DocEvent::Submit, DocEvent::Confirm], user)?;

    let mut gt = engine.create_document(
        DocType::GoodsTransfer,
        source.clone().with_destination(store_wh.clone(), bin.clone()),
        vec![LineInput::new(widget.clone(), "EA", TrackingType::None, 20)],
        user,
    )?;
    if gt.linked_gi_no().is_none() {
        gt = engine.transition(gt.doc_id(), DocEvent::Export, user, None)?;
    }
    let export = engine.find_document(gt.linked_gi_no().context("transfer has no export issue")?)?;
    run(&engine, &export, &[DocEvent::StartPicking, DocEvent::Submit, DocEvent::Confirm], user)?;
    let gt = engine.get_document(gt.doc_id())?;
    let import_no = gt.linked_gr_no().context("transfer has no import receipt")?;
    let import = engine.find_document(import_no)?;
    run(&engine, &import, &[DocEvent::StartReceiving, DocEvent::Submit, DocEvent::Confirm], user)?;

    let ic = engine.create_document(
        DocType::InventoryCount,
        source.clone(),
        vec![LineInput::new(widget.clone(), "EA", TrackingType::None, 0)],
        user,
    )?;
    let ic = run(&engine, &ic, &[DocEvent::StartCounting], user)?;
    engine.record_counts(ic.doc_id(), &[CountEntry::new(1, 48)], user)?;
    run(&engine, &ic, &[DocEvent::SubmitForReview], user)?;
    let variance = engine.query_variance(ic.doc_id())?;
    run(&engine, &ic, &[DocEvent::Complete], user)?;

    let gt = engine.get_document(gt.doc_id())?;
    if gt.status() != DocStatus::Completed {
        bail!("transfer {} ended in {}", gt.doc_no(), gt.status());
    }

    let report = json!({
        "onhand": [
            { "warehouse": main_wh, "records": engine.list_onhand(&main_wh) },
            { "warehouse": store_wh, "records": engine.list_onhand(&store_wh) },
        ],
        "count_variance": variance,
        "transfer": {
            "doc_no": gt.doc_no(),
            "status": gt.status(),
            "shortfalls": gt.shortfalls(),
        },
        "audit_events": engine.bus().journal().len(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run(
    engine: &Engine,
    doc: &Document,
    events: &[DocEvent],
    user: UserId,
) -> anyhow::Result<Document> {
    let mut current = doc.clone();
    for event in events {
        current = engine
            .transition(current.doc_id(), event.clone(), user, None)
            .with_context(|| format!("{} {}", doc.doc_no(), event))?;
    }
    Ok(current)
}
