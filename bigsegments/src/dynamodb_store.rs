//! DynamoDB-backed big segment store.
//!
//! A single table (partition key `namespace`, sort key `key`) holds two row
//! shapes. One metadata row per environment carries the cursor and the
//! synchronized timestamp as separate attributes. One row per user carries
//! two string-set attributes, the segment IDs including and excluding that
//! user.
//!
//! Patch application runs as transactional writes: every batch carries a
//! condition check asserting the metadata cursor still equals the patch's
//! `previousVersion`, followed by one set-add or set-delete update per
//! affected user. `TransactWriteItems` accepts at most 25 items per call,
//! so large patches split into several sequential transactions, and the
//! cursor only advances through a final conditioned update once every batch
//! has committed.
//!
//! Known consistency gap: the batches of one patch commit independently. A
//! crash or error after an early batch commits leaves partially-applied
//! membership under the pre-patch cursor. There is no cross-batch
//! transaction scheme; `build_mutation_batches` makes the batch boundaries
//! visible to tests.

use crate::patch::Patch;
use crate::store::{
    BigSegmentStore, DynamoDbStoreConfig, Result, StoreError, UnixMillis, prefixed_key,
};
use async_trait::async_trait;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::error::{DisplayErrorContext, SdkError};
use aws_sdk_dynamodb::operation::transact_write_items::TransactWriteItemsError;
use aws_sdk_dynamodb::operation::update_item::UpdateItemError;
use aws_sdk_dynamodb::types::{AttributeValue, ConditionCheck, TransactWriteItem, Update};

const ATTR_NAMESPACE: &str = "namespace";
const ATTR_SORT_KEY: &str = "key";
const ATTR_CURSOR: &str = "cursor";
const ATTR_SYNCHRONIZED_ON: &str = "synchronizedOn";
const ATTR_INCLUDED: &str = "included";
const ATTR_EXCLUDED: &str = "excluded";

const METADATA_KEY: &str = "big_segments_metadata";
const USER_DATA_KEY: &str = "big_segments_user";

/// DynamoDB caps `TransactWriteItems` at 25 items per call; one slot per
/// batch is reserved for the cursor condition check.
const MAX_TRANSACTION_ITEMS: usize = 25;

pub struct DynamoDbBigSegmentStore {
    client: Client,
    table: String,
    metadata_key: String,
    user_data_key: String,
}

impl DynamoDbBigSegmentStore {
    pub async fn new(config: &DynamoDbStoreConfig) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint.as_str());
        }
        let shared_config = loader.load().await;
        tracing::debug!(table = %config.table, prefix = %config.prefix, "Connected DynamoDB big segment store");
        Ok(Self::with_client(Client::new(&shared_config), config))
    }

    /// Builds a store around an existing client; used when the caller
    /// manages AWS configuration itself.
    pub fn with_client(client: Client, config: &DynamoDbStoreConfig) -> Self {
        DynamoDbBigSegmentStore {
            client,
            table: config.table.clone(),
            metadata_key: prefixed_key(&config.prefix, METADATA_KEY),
            user_data_key: prefixed_key(&config.prefix, USER_DATA_KEY),
        }
    }

    fn metadata_row_key(&self) -> (AttributeValue, AttributeValue) {
        (
            AttributeValue::S(self.metadata_key.clone()),
            AttributeValue::S(self.metadata_key.clone()),
        )
    }
}

#[async_trait]
impl BigSegmentStore for DynamoDbBigSegmentStore {
    async fn apply_patch(&self, patch: &Patch) -> Result<bool> {
        let batches = build_mutation_batches(
            &self.table,
            &self.metadata_key,
            &self.user_data_key,
            patch,
        )?;

        for batch in batches {
            let result = self
                .client
                .transact_write_items()
                .set_transact_items(Some(batch))
                .send()
                .await;
            if let Err(err) = result {
                if is_stale_cursor_cancellation(&err) {
                    return Ok(false);
                }
                return Err(sdk_error(err));
            }
        }

        // All membership batches committed; advance the cursor under the
        // same condition the batches carried.
        let (namespace, sort_key) = self.metadata_row_key();
        let mut request = self
            .client
            .update_item()
            .table_name(&self.table)
            .key(ATTR_NAMESPACE, namespace)
            .key(ATTR_SORT_KEY, sort_key)
            .update_expression("SET #cursor = :version")
            .expression_attribute_names("#cursor", ATTR_CURSOR)
            .expression_attribute_values(":version", AttributeValue::S(patch.version.clone()));
        request = if patch.previous_version.is_empty() {
            request.condition_expression("attribute_not_exists(#cursor)")
        } else {
            request
                .condition_expression("#cursor = :prev")
                .expression_attribute_values(":prev", AttributeValue::S(patch.previous_version.clone()))
        };

        match request.send().await {
            Ok(_) => Ok(true),
            Err(err) if is_conditional_check_failure(&err) => Ok(false),
            Err(err) => Err(sdk_error(err)),
        }
    }

    async fn get_cursor(&self) -> Result<String> {
        let (namespace, sort_key) = self.metadata_row_key();
        let output = self
            .client
            .get_item()
            .table_name(&self.table)
            .key(ATTR_NAMESPACE, namespace)
            .key(ATTR_SORT_KEY, sort_key)
            .consistent_read(true)
            .send()
            .await
            .map_err(sdk_error)?;

        Ok(output
            .item()
            .and_then(|item| item.get(ATTR_CURSOR))
            .and_then(|value| value.as_s().ok())
            .cloned()
            .unwrap_or_default())
    }

    async fn set_synchronized_on(&self, timestamp: UnixMillis) -> Result<()> {
        let (namespace, sort_key) = self.metadata_row_key();
        self.client
            .update_item()
            .table_name(&self.table)
            .key(ATTR_NAMESPACE, namespace)
            .key(ATTR_SORT_KEY, sort_key)
            .update_expression("SET #ts = :ts")
            .expression_attribute_names("#ts", ATTR_SYNCHRONIZED_ON)
            .expression_attribute_values(":ts", AttributeValue::N(timestamp.to_string()))
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn get_synchronized_on(&self) -> Result<Option<UnixMillis>> {
        let (namespace, sort_key) = self.metadata_row_key();
        let output = self
            .client
            .get_item()
            .table_name(&self.table)
            .key(ATTR_NAMESPACE, namespace)
            .key(ATTR_SORT_KEY, sort_key)
            .consistent_read(true)
            .send()
            .await
            .map_err(sdk_error)?;

        let Some(value) = output.item().and_then(|item| item.get(ATTR_SYNCHRONIZED_ON)) else {
            return Ok(None);
        };
        let raw = value.as_n().map_err(|_| {
            StoreError::MalformedValue(format!("non-numeric {ATTR_SYNCHRONIZED_ON} attribute"))
        })?;
        raw.parse().map(Some).map_err(|_| {
            StoreError::MalformedValue(format!("unparseable {ATTR_SYNCHRONIZED_ON} value: {raw}"))
        })
    }

    async fn close(&self) -> Result<()> {
        // The SDK client holds no resources that need explicit teardown.
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SetOp {
    Add,
    Delete,
}

#[derive(Debug, PartialEq, Eq)]
struct UserUpdate<'a> {
    user_key: &'a str,
    attribute: &'static str,
    op: SetOp,
}

/// Flattens a patch's four change lists into per-user set mutations, in
/// wire order: included adds, included removes, excluded adds, excluded
/// removes.
fn plan_user_updates(patch: &Patch) -> Vec<UserUpdate<'_>> {
    let lists = [
        (&patch.changes.included.add, ATTR_INCLUDED, SetOp::Add),
        (&patch.changes.included.remove, ATTR_INCLUDED, SetOp::Delete),
        (&patch.changes.excluded.add, ATTR_EXCLUDED, SetOp::Add),
        (&patch.changes.excluded.remove, ATTR_EXCLUDED, SetOp::Delete),
    ];

    let mut updates = Vec::with_capacity(patch.affected_user_count());
    for (user_keys, attribute, op) in lists {
        for user_key in user_keys {
            updates.push(UserUpdate {
                user_key,
                attribute,
                op,
            });
        }
    }
    updates
}

fn build_condition_check(
    table: &str,
    metadata_key: &str,
    previous_version: &str,
) -> Result<TransactWriteItem> {
    let mut builder = ConditionCheck::builder()
        .table_name(table)
        .key(ATTR_NAMESPACE, AttributeValue::S(metadata_key.to_string()))
        .key(ATTR_SORT_KEY, AttributeValue::S(metadata_key.to_string()))
        .expression_attribute_names("#cursor", ATTR_CURSOR);
    builder = if previous_version.is_empty() {
        builder.condition_expression("attribute_not_exists(#cursor)")
    } else {
        builder
            .condition_expression("#cursor = :prev")
            .expression_attribute_values(":prev", AttributeValue::S(previous_version.to_string()))
    };
    let check = builder
        .build()
        .map_err(|err| StoreError::DynamoDb(err.to_string()))?;
    Ok(TransactWriteItem::builder().condition_check(check).build())
}

fn build_user_update(
    table: &str,
    user_data_key: &str,
    segment_id: &str,
    update: &UserUpdate<'_>,
) -> Result<TransactWriteItem> {
    let verb = match update.op {
        SetOp::Add => "ADD",
        SetOp::Delete => "DELETE",
    };
    let item = Update::builder()
        .table_name(table)
        .key(ATTR_NAMESPACE, AttributeValue::S(user_data_key.to_string()))
        .key(ATTR_SORT_KEY, AttributeValue::S(update.user_key.to_string()))
        .update_expression(format!("{verb} #attr :segments"))
        .expression_attribute_names("#attr", update.attribute)
        .expression_attribute_values(":segments", AttributeValue::Ss(vec![segment_id.to_string()]))
        .build()
        .map_err(|err| StoreError::DynamoDb(err.to_string()))?;
    Ok(TransactWriteItem::builder().update(item).build())
}

/// Splits a patch into transactional-write batches of at most
/// [`MAX_TRANSACTION_ITEMS`] items, re-including the cursor condition check
/// in every batch. A patch with no membership changes produces no batches;
/// only the conditioned cursor update runs.
fn build_mutation_batches(
    table: &str,
    metadata_key: &str,
    user_data_key: &str,
    patch: &Patch,
) -> Result<Vec<Vec<TransactWriteItem>>> {
    let updates = plan_user_updates(patch);
    let mut batches = Vec::new();
    for chunk in updates.chunks(MAX_TRANSACTION_ITEMS - 1) {
        let mut items = Vec::with_capacity(chunk.len() + 1);
        items.push(build_condition_check(
            table,
            metadata_key,
            &patch.previous_version,
        )?);
        for update in chunk {
            items.push(build_user_update(
                table,
                user_data_key,
                &patch.segment_id,
                update,
            )?);
        }
        batches.push(items);
    }
    Ok(batches)
}

fn is_stale_cursor_cancellation(err: &SdkError<TransactWriteItemsError>) -> bool {
    match err {
        SdkError::ServiceError(context) => match context.err() {
            TransactWriteItemsError::TransactionCanceledException(cancellation) => cancellation
                .cancellation_reasons()
                .iter()
                .any(|reason| reason.code() == Some("ConditionalCheckFailed")),
            _ => false,
        },
        _ => false,
    }
}

fn is_conditional_check_failure(err: &SdkError<UpdateItemError>) -> bool {
    matches!(
        err,
        SdkError::ServiceError(context)
            if matches!(context.err(), UpdateItemError::ConditionalCheckFailedException(_))
    )
}

fn sdk_error<E>(err: SdkError<E>) -> StoreError
where
    SdkError<E>: std::error::Error,
{
    StoreError::DynamoDb(format!("{}", DisplayErrorContext(err)))
}
