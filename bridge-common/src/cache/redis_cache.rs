use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::warn;

use super::{within, AggregateCache, CacheError};
use crate::amount::parse_decimal;
use crate::types::{AggregateDelta, AggregateKind, AggregateRecord};

/// Adds signed decimal strings to hash fields without going through floats.
///
/// KEYS[i] is the hash of the i-th increment, ARGV[2i-1] its field and
/// ARGV[2i] its delta. Every new total is computed before anything is written,
/// so a malformed value leaves all fields untouched. Returns the new totals in
/// KEYS order.
const INCREMENT_SCRIPT: &str = r#"
local function parse(value)
  local negative = false
  if string.sub(value, 1, 1) == '-' then
    negative = true
    value = string.sub(value, 2)
  end
  local int, frac = string.match(value, '^(%d+)%.?(%d*)$')
  if not int then
    error('not a decimal: ' .. value)
  end
  return negative, int, frac
end

local function add_digits(a, b)
  local out, carry = {}, 0
  for i = #a, 1, -1 do
    local d = string.byte(a, i) + string.byte(b, i) - 96 + carry
    if d >= 10 then
      d = d - 10
      carry = 1
    else
      carry = 0
    end
    out[#out + 1] = string.char(d + 48)
  end
  if carry == 1 then
    out[#out + 1] = '1'
  end
  return string.reverse(table.concat(out))
end

local function sub_digits(a, b)
  local out, borrow = {}, 0
  for i = #a, 1, -1 do
    local d = string.byte(a, i) - string.byte(b, i) - borrow
    if d < 0 then
      d = d + 10
      borrow = 1
    else
      borrow = 0
    end
    out[#out + 1] = string.char(d + 48)
  end
  return string.reverse(table.concat(out))
end

local function add_decimal(a, b)
  local neg_a, int_a, frac_a = parse(a)
  local neg_b, int_b, frac_b = parse(b)
  local scale = math.max(#frac_a, #frac_b)
  local width = math.max(#int_a, #int_b)
  local da = string.rep('0', width - #int_a) .. int_a .. frac_a .. string.rep('0', scale - #frac_a)
  local db = string.rep('0', width - #int_b) .. int_b .. frac_b .. string.rep('0', scale - #frac_b)

  local digits, negative
  if neg_a == neg_b then
    digits, negative = add_digits(da, db), neg_a
  elseif da >= db then
    digits, negative = sub_digits(da, db), neg_a
  else
    digits, negative = sub_digits(db, da), neg_b
  end

  local int = (string.gsub(string.sub(digits, 1, #digits - scale), '^0+', ''))
  local frac = (string.gsub(string.sub(digits, #digits - scale + 1), '0+$', ''))
  if int == '' then
    int = '0'
  end
  local result = int
  if frac ~= '' then
    result = result .. '.' .. frac
  end
  if negative and result ~= '0' then
    result = '-' .. result
  end
  return result
end

local totals = {}
for i = 1, #KEYS do
  local current = redis.call('HGET', KEYS[i], ARGV[2 * i - 1])
  if not current then
    current = '0'
  end
  totals[i] = add_decimal(current, ARGV[2 * i])
end
for i = 1, #KEYS do
  redis.call('HSET', KEYS[i], ARGV[2 * i - 1], totals[i])
end
return totals
"#;

/// Aggregate cache backed by one redis hash per aggregate kind.
pub struct RedisAggregateCache {
    client: redis::Client,
    connection: MultiplexedConnection,
    increment: redis::Script,
}

impl RedisAggregateCache {
    /// Connect to `addr`. Both timeouts must be non-zero; command timeouts
    /// surface as `CacheError::Timeout`.
    pub async fn connect(
        addr: &str,
        response_timeout: Duration,
        connection_timeout: Duration,
    ) -> Result<RedisAggregateCache, CacheError> {
        if response_timeout.is_zero() || connection_timeout.is_zero() {
            return Err(CacheError::InvalidConfiguration(
                "redis timeouts cannot be zero".to_owned(),
            ));
        }

        let client = redis::Client::open(addr)?;
        let config = redis::AsyncConnectionConfig::new()
            .set_response_timeout(response_timeout)
            .set_connection_timeout(connection_timeout);
        let connection = client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;

        Ok(RedisAggregateCache {
            client,
            connection,
            increment: redis::Script::new(INCREMENT_SCRIPT),
        })
    }
}

impl RedisAggregateCache {
    async fn run_increments(
        &self,
        deltas: &[AggregateDelta],
    ) -> Result<Vec<AggregateRecord>, CacheError> {
        // Reject before the round trip so the script only ever sees well-formed input.
        for delta in deltas {
            parse_decimal(&delta.delta).map_err(|source| CacheError::InvalidValue {
                key: delta.key.clone(),
                source,
            })?;
        }

        let mut invocation = self.increment.prepare_invoke();
        for delta in deltas {
            invocation
                .key(delta.kind.cache_key())
                .arg(&delta.key)
                .arg(&delta.delta);
        }

        let mut conn = self.connection.clone();
        let totals: Vec<String> = invocation.invoke_async(&mut conn).await?;
        if totals.len() != deltas.len() {
            return Err(CacheError::UnexpectedReply(format!(
                "expected {} totals, got {}",
                deltas.len(),
                totals.len()
            )));
        }

        Ok(deltas
            .iter()
            .zip(totals)
            .map(|(delta, total)| AggregateRecord::from_delta(delta, total))
            .collect())
    }
}

#[async_trait]
impl AggregateCache for RedisAggregateCache {
    async fn get_current(&self, kind: AggregateKind, key: &str) -> Result<String, CacheError> {
        let mut conn = self.connection.clone();
        let total: Option<String> = conn.hget(kind.cache_key(), key).await?;
        Ok(total.unwrap_or_else(|| "0".to_owned()))
    }

    async fn get_all(&self, kind: AggregateKind) -> Result<HashMap<String, String>, CacheError> {
        let mut conn = self.connection.clone();
        let totals: HashMap<String, String> = conn.hgetall(kind.cache_key()).await?;
        Ok(totals)
    }

    async fn atomic_increment(
        &self,
        kind: AggregateKind,
        key: &str,
        delta: &str,
    ) -> Result<String, CacheError> {
        let delta = AggregateDelta::new(kind, key, delta);
        let mut records = self.run_increments(std::slice::from_ref(&delta)).await?;
        records
            .pop()
            .map(|record| record.total)
            .ok_or_else(|| CacheError::UnexpectedReply("script returned no total".to_owned()))
    }

    /// One script invocation, so there is no partially applied prefix to revert.
    async fn increment_all(
        &self,
        deltas: &[AggregateDelta],
        operation_timeout: Duration,
    ) -> Result<Vec<AggregateRecord>, CacheError> {
        within(operation_timeout, self.run_increments(deltas)).await
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, CacheError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        Ok(pubsub
            .into_on_message()
            .filter_map(|message| async move {
                match message.get_payload::<String>() {
                    Ok(payload) => Some(payload),
                    Err(err) => {
                        warn!(channel = message.get_channel_name(), "dropping non-utf8 message: {}", err);
                        None
                    }
                }
            })
            .boxed())
    }
}
