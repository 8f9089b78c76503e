//! Server-side scripts for the slot store.
//!
//! Every mutating operation is a single atomic script so concurrent gateway
//! replicas cannot observe half-applied slot state. All clocks come from the
//! Redis `TIME` command; replica wall clocks never enter the data.

/// Acquire a member-keyed slot (user slots, plain account slots).
///
/// KEYS[1] = sorted-set key, ARGV = max_concurrency, ttl_secs, member.
/// Returns 1 on success, 0 when the pool is at capacity. Re-acquiring an
/// existing member refreshes its score so retries do not double-count.
pub(crate) const ACQUIRE_SLOT: &str = r#"
local key = KEYS[1]
local max_concurrency = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])
local member = ARGV[3]

local time = redis.call('TIME')
local now = tonumber(time[1])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - ttl)

if redis.call('ZSCORE', key, member) then
  redis.call('ZADD', key, now, member)
  redis.call('EXPIRE', key, ttl)
  return 1
end

if redis.call('ZCARD', key) < max_concurrency then
  redis.call('ZADD', key, now, member)
  redis.call('EXPIRE', key, ttl)
  return 1
end

return 0
"#;

/// Claim an indexed slot inside [range_start, range_end), preferring the
/// target index. Hard isolation: the scan never leaves the range, so an opus
/// burst cannot drain the sonnet pool. There are more positions than seats,
/// so the claim also honors the account-wide occupancy cap.
///
/// KEYS[1] = sorted-set key.
/// ARGV = ttl_secs, target, range_start, range_end, max_concurrency.
/// Returns the claimed index or -1 when the range or the account is
/// saturated.
pub(crate) const ACQUIRE_SLOT_IN_RANGE: &str = r#"
local key = KEYS[1]
local ttl = tonumber(ARGV[1])
local target = tonumber(ARGV[2])
local range_start = tonumber(ARGV[3])
local range_end = tonumber(ARGV[4])
local max_concurrency = tonumber(ARGV[5])

local time = redis.call('TIME')
local now = tonumber(time[1])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - ttl)

if redis.call('ZCARD', key) >= max_concurrency then
  return -1
end

if target >= range_start and target < range_end then
  if not redis.call('ZSCORE', key, 'slot_' .. target) then
    redis.call('ZADD', key, now, 'slot_' .. target)
    redis.call('EXPIRE', key, ttl)
    return target
  end
end

for i = range_start, range_end - 1 do
  if i ~= target and not redis.call('ZSCORE', key, 'slot_' .. i) then
    redis.call('ZADD', key, now, 'slot_' .. i)
    redis.call('EXPIRE', key, ttl)
    return i
  end
end

return -1
"#;

/// Session-aware slot claim. A slot is either free, held by the same session
/// (count < max_parallel permits one more holder), or held by another
/// session. The ZSCORE re-check on the free path guards the window between
/// "release regular slot" and "re-acquire as haiku slot", where the sorted
/// set can be claimed by a request that has no owner record yet. Claiming a
/// free slot also honors the account-wide occupancy cap; same-session
/// increments do not add occupancy and skip it.
///
/// KEYS[1] = slot_owner hash, KEYS[2] = account sorted-set key.
/// ARGV = ttl_secs, slot_index, session_hash, max_parallel, max_concurrency.
/// Returns 1 on success, 0 otherwise.
pub(crate) const ACQUIRE_SLOT_WITH_SESSION: &str = r#"
local owner_key = KEYS[1]
local slot_key = KEYS[2]
local ttl = tonumber(ARGV[1])
local slot_index = ARGV[2]
local session = ARGV[3]
local max_parallel = tonumber(ARGV[4])
local max_concurrency = tonumber(ARGV[5])
local slot_id = 'slot_' .. slot_index

local time = redis.call('TIME')
local now = tonumber(time[1])

local owner = nil
local count = 0
local expire_at = 0
local data = redis.call('HGETALL', owner_key)
for i = 1, #data, 2 do
  if data[i] == 'owner' then
    owner = data[i + 1]
  elseif data[i] == 'count' then
    count = tonumber(data[i + 1])
  elseif data[i] == 'expire' then
    expire_at = tonumber(data[i + 1])
  end
end

if expire_at > 0 and expire_at < now then
  redis.call('DEL', owner_key)
  redis.call('ZREM', slot_key, slot_id)
  owner = nil
  count = 0
end

if owner == nil or count == 0 then
  if redis.call('ZSCORE', slot_key, slot_id) then
    return 0
  end
  if redis.call('ZCARD', slot_key) >= max_concurrency then
    return 0
  end
  redis.call('HSET', owner_key, 'owner', session, 'count', 1, 'expire', now + ttl)
  redis.call('EXPIRE', owner_key, ttl)
  redis.call('ZADD', slot_key, now, slot_id)
  redis.call('EXPIRE', slot_key, ttl)
  return 1
end

if owner == session then
  if count < max_parallel then
    redis.call('HINCRBY', owner_key, 'count', 1)
    redis.call('HSET', owner_key, 'expire', now + ttl)
    redis.call('EXPIRE', owner_key, ttl)
    redis.call('ZADD', slot_key, now, slot_id)
    redis.call('EXPIRE', slot_key, ttl)
    return 1
  end
  return 0
end

return 0
"#;

/// Owner-only decrement of a session-held slot; removes the owner record and
/// the slot membership atomically when the count reaches zero.
///
/// KEYS[1] = slot_owner hash, KEYS[2] = account sorted-set key.
/// ARGV = slot_index, session_hash. Returns 1 when released, 0 otherwise.
pub(crate) const RELEASE_SLOT_WITH_SESSION: &str = r#"
local owner_key = KEYS[1]
local slot_key = KEYS[2]
local slot_id = 'slot_' .. ARGV[1]
local session = ARGV[2]

if redis.call('HGET', owner_key, 'owner') ~= session then
  return 0
end

local count = redis.call('HINCRBY', owner_key, 'count', -1)
if count <= 0 then
  redis.call('DEL', owner_key)
  redis.call('ZREM', slot_key, slot_id)
end
return 1
"#;

/// KEYS[1] = mutex key, ARGV = ttl_secs, holder request id.
pub(crate) const ACQUIRE_SESSION_MUTEX: &str = r#"
if redis.call('SET', KEYS[1], ARGV[2], 'NX', 'EX', tonumber(ARGV[1])) then
  return 1
end
return 0
"#;

/// Holder-only delete. KEYS[1] = mutex key, ARGV[1] = holder request id.
pub(crate) const RELEASE_SESSION_MUTEX: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('DEL', KEYS[1])
  return 1
end
return 0
"#;

/// Bounded wait-queue counter. The TTL is set only on the 0 -> 1 transition:
/// refreshing it on every increment would let a broken decrement path keep a
/// zombie counter alive forever.
///
/// KEYS[1] = counter key, ARGV = max_waiting, ttl_secs.
pub(crate) const INCREMENT_WAIT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current >= tonumber(ARGV[1]) then
  return 0
end

local value = redis.call('INCR', KEYS[1])
if value == 1 then
  redis.call('EXPIRE', KEYS[1], tonumber(ARGV[2]))
end
return 1
"#;

/// Decrement with a floor of zero. KEYS[1] = counter key.
pub(crate) const DECREMENT_WAIT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current and tonumber(current) > 0 then
  redis.call('DECR', KEYS[1])
end
return 1
"#;

/// Prune then count. KEYS[1] = sorted-set key, ARGV[1] = ttl_secs.
pub(crate) const LIVE_COUNT: &str = r#"
local time = redis.call('TIME')
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', tonumber(time[1]) - tonumber(ARGV[1]))
return redis.call('ZCARD', KEYS[1])
"#;

/// Batch load snapshot feeding the account selector: one round trip instead
/// of N. ARGV = ttl_secs, namespace, then (account_id, max_concurrency)
/// pairs. Returns a flat [id, current, waiting, load_percent, ...] array.
pub(crate) const LOAD_BATCH: &str = r#"
local ttl = tonumber(ARGV[1])
local ns = ARGV[2]

local time = redis.call('TIME')
local cutoff = tonumber(time[1]) - ttl

local result = {}
local i = 3
while i <= #ARGV do
  local account_id = ARGV[i]
  local max_concurrency = tonumber(ARGV[i + 1])

  local slot_key = ns .. 'concurrency:account:' .. account_id
  redis.call('ZREMRANGEBYSCORE', slot_key, '-inf', cutoff)
  local current = redis.call('ZCARD', slot_key)

  local waiting = tonumber(redis.call('GET', ns .. 'wait:account:' .. account_id) or '0')

  local load = 0
  if max_concurrency > 0 then
    load = math.floor((current + waiting) * 100 / max_concurrency)
  end

  table.insert(result, account_id)
  table.insert(result, current)
  table.insert(result, waiting)
  table.insert(result, load)
  i = i + 2
end
return result
"#;

/// Append to a sliding window, pruning everything outside it first. Members
/// are caller-supplied unique ids; scores are server milliseconds so replica
/// clock skew cannot reorder the window.
///
/// KEYS[1] = window key, ARGV = window_ms, key_ttl_secs, member.
/// Returns the post-insert cardinality.
pub(crate) const RECORD_WINDOW: &str = r#"
local key = KEYS[1]
local window_ms = tonumber(ARGV[1])
local key_ttl = tonumber(ARGV[2])

local time = redis.call('TIME')
local now_ms = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)

redis.call('ZREMRANGEBYSCORE', key, '-inf', now_ms - window_ms)
redis.call('ZADD', key, now_ms, ARGV[3])
redis.call('EXPIRE', key, key_ttl)
return redis.call('ZCARD', key)
"#;

/// Prune then count a sliding window. KEYS[1] = window key, ARGV[1] = window_ms.
pub(crate) const WINDOW_COUNT: &str = r#"
local key = KEYS[1]
local window_ms = tonumber(ARGV[1])

local time = redis.call('TIME')
local now_ms = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)

redis.call('ZREMRANGEBYSCORE', key, '-inf', now_ms - window_ms)
return redis.call('ZCARD', key)
"#;

/// Milliseconds until the oldest member of a window expires, or -1 when the
/// window is empty. Computed server-side so the caller never compares a
/// server score with its own clock.
pub(crate) const WINDOW_OLDEST_REMAINING: &str = r#"
local key = KEYS[1]
local window_ms = tonumber(ARGV[1])

local time = redis.call('TIME')
local now_ms = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)

redis.call('ZREMRANGEBYSCORE', key, '-inf', now_ms - window_ms)
local first = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if #first == 0 then
  return -1
end
return tonumber(first[2]) + window_ms - now_ms
"#;

/// Record a slot's response-end instant using the server clock.
/// KEYS[1] = response-end key, ARGV[1] = key_ttl_secs.
pub(crate) const SET_RESPONSE_END: &str = r#"
local time = redis.call('TIME')
redis.call('SET', KEYS[1], time[1], 'EX', tonumber(ARGV[1]))
return 1
"#;

/// Seconds elapsed since a slot's recorded response end, or -1 when there is
/// no record.
pub(crate) const RESPONSE_END_ELAPSED: &str = r#"
local value = redis.call('GET', KEYS[1])
if not value then
  return -1
end
local time = redis.call('TIME')
local elapsed = tonumber(time[1]) - tonumber(value)
if elapsed < 0 then
  elapsed = 0
end
return elapsed
"#;

/// Increment the per-minute request counter used by weighted load balancing.
/// ARGV = namespace, account_id, retain_minutes. The bucket minute comes from
/// the server clock.
pub(crate) const INCR_REQUEST_COUNT: &str = r#"
local ns = ARGV[1]
local account_id = ARGV[2]
local retain_minutes = tonumber(ARGV[3])

local time = redis.call('TIME')
local minute = math.floor(tonumber(time[1]) / 60)

local key = ns .. 'lb:req:' .. account_id .. ':' .. minute
local value = redis.call('INCR', key)
if value == 1 then
  redis.call('EXPIRE', key, (retain_minutes + 2) * 60)
end
return value
"#;

/// Sum the per-minute request counters over the trailing window for a batch
/// of accounts. ARGV = namespace, window_minutes, then account ids. Returns a
/// flat [id, total, ...] array.
pub(crate) const REQUEST_COUNTS: &str = r#"
local ns = ARGV[1]
local window = tonumber(ARGV[2])

local time = redis.call('TIME')
local minute = math.floor(tonumber(time[1]) / 60)

local result = {}
for i = 3, #ARGV do
  local account_id = ARGV[i]
  local total = 0
  for m = minute - window + 1, minute do
    local value = redis.call('GET', ns .. 'lb:req:' .. account_id .. ':' .. m)
    if value then
      total = total + tonumber(value)
    end
  end
  table.insert(result, account_id)
  table.insert(result, total)
end
return result
"#;

/// Remove expired members from one sorted set; returns the removed count.
/// KEYS[1] = sorted-set key, ARGV[1] = ttl_secs.
pub(crate) const CLEANUP_EXPIRED: &str = r#"
local time = redis.call('TIME')
return redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', tonumber(time[1]) - tonumber(ARGV[1]))
"#;
