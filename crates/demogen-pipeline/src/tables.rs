//! Structured tables derived directly from the entity universe and the
//! rendered prompts.

use demogen_core::records::{ENTITIES_TABLE, FINANCIALS_TABLE, PROMPTS_TABLE};
use demogen_core::{EntityRow, EntityUniverse, FinancialRow, PromptInstance, PromptRow};
use demogen_storage::{Table, Warehouse};

use crate::PipelineError;

/// Replace `entities` and `quarterly_financials`. Returns (table, rows) pairs.
pub fn write_structured_tables(
    warehouse: &Warehouse,
    universe: &EntityUniverse,
) -> Result<Vec<(String, usize)>, PipelineError> {
    let entities: Vec<EntityRow> = universe.entities().iter().map(EntityRow::from).collect();
    let financials = FinancialRow::rows_for(universe);

    let mut written = Vec::with_capacity(2);
    for table in [
        Table::from_records(ENTITIES_TABLE, &entities)?,
        Table::from_records(FINANCIALS_TABLE, &financials)?,
    ] {
        warehouse.create_or_replace_table(&table)?;
        tracing::info!(table = %table.name, rows = table.len(), "table replaced");
        written.push((table.name.clone(), table.len()));
    }
    Ok(written)
}

/// Persist the full rendered prompt text, so completion needs nothing but this table.
pub fn write_prompt_table(
    warehouse: &Warehouse,
    prompts: &[PromptInstance],
) -> Result<usize, PipelineError> {
    let rows: Vec<PromptRow> = prompts.iter().map(PromptRow::from).collect();
    let table = Table::from_records(PROMPTS_TABLE, &rows)?;
    warehouse.create_or_replace_table(&table)?;
    tracing::info!(table = PROMPTS_TABLE, rows = table.len(), "table replaced");
    Ok(table.len())
}
