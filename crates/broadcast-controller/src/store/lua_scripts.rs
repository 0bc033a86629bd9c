//! Lua scripts for atomic conditional operations on Redis.
//!
//! Each script runs atomically, so a precondition check and the write it
//! guards can never interleave with another client's write.
//!
//! Conditions are passed as a count followed by field/value pairs. A
//! condition holds when `HGET key field` equals the value exactly; a
//! missing field never matches.

/// Write a whole record with expiry.
///
/// Arguments:
/// - KEYS[1]: Record key
/// - ARGV[1]: Mode (`upsert` or `if_absent`)
/// - ARGV[2]: Absolute expiry (epoch seconds)
/// - ARGV[3..]: Field/value pairs
///
/// Returns:
/// - 1: Written
/// - 0: Key exists and mode is `if_absent`
pub const PUT_RECORD: &str = r#"
if ARGV[1] == 'if_absent' and redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end

redis.call('DEL', KEYS[1])
for i = 3, #ARGV, 2 do
    redis.call('HSET', KEYS[1], ARGV[i], ARGV[i+1])
end
redis.call('EXPIREAT', KEYS[1], ARGV[2])
return 1
"#;

/// Set fields on an existing record if all conditions hold.
///
/// Arguments:
/// - KEYS[1]: Record key
/// - ARGV[1]: Condition count `n`
/// - ARGV[2..2n+1]: Condition field/value pairs
/// - ARGV[2n+2..]: Field/value pairs to set
///
/// Returns:
/// - {-1}: Record missing
/// - {0}: A condition failed
/// - {1, field, value, ...}: Applied, followed by the record after the write
pub const CONDITIONAL_UPDATE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return {-1}
end

local n = tonumber(ARGV[1])
for i = 0, n - 1 do
    local field = ARGV[2 + i * 2]
    local expected = ARGV[3 + i * 2]
    if redis.call('HGET', KEYS[1], field) ~= expected then
        return {0}
    end
end

for i = 2 + n * 2, #ARGV, 2 do
    redis.call('HSET', KEYS[1], ARGV[i], ARGV[i+1])
end

local out = {1}
for _, v in ipairs(redis.call('HGETALL', KEYS[1])) do
    out[#out + 1] = v
end
return out
"#;

/// Add a delta to an integer field, guarded by conditions and bounds.
///
/// Arguments:
/// - KEYS[1]: Record key
/// - ARGV[1]: Field name
/// - ARGV[2]: Delta
/// - ARGV[3]: Minimum allowed result, or empty string for none
/// - ARGV[4]: Maximum allowed result, or empty string for none
/// - ARGV[5]: Condition count `n`
/// - ARGV[6..]: Condition field/value pairs
///
/// Returns:
/// - {-1, 0}: Record missing
/// - {0, 0}: A condition failed
/// - {-2, current}: Result would leave bounds, nothing written
/// - {1, new}: Applied
pub const CONDITIONAL_INCREMENT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return {-1, 0}
end

local n = tonumber(ARGV[5])
for i = 0, n - 1 do
    local field = ARGV[6 + i * 2]
    local expected = ARGV[7 + i * 2]
    if redis.call('HGET', KEYS[1], field) ~= expected then
        return {0, 0}
    end
end

local current = tonumber(redis.call('HGET', KEYS[1], ARGV[1])) or 0
local new_value = current + tonumber(ARGV[2])

if ARGV[3] ~= '' and new_value < tonumber(ARGV[3]) then
    return {-2, current}
end
if ARGV[4] ~= '' and new_value > tonumber(ARGV[4]) then
    return {-2, current}
end

redis.call('HSET', KEYS[1], ARGV[1], new_value)
return {1, new_value}
"#;

/// Delete a record if all conditions hold, returning what was deleted.
///
/// Arguments:
/// - KEYS[1]: Record key
/// - ARGV[1]: Condition count `n`
/// - ARGV[2..]: Condition field/value pairs
///
/// Returns:
/// - {-1}: Record missing
/// - {0}: A condition failed
/// - {1, field, value, ...}: Deleted, followed by the record as it was
pub const CONDITIONAL_DELETE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return {-1}
end

local n = tonumber(ARGV[1])
for i = 0, n - 1 do
    local field = ARGV[2 + i * 2]
    local expected = ARGV[3 + i * 2]
    if redis.call('HGET', KEYS[1], field) ~= expected then
        return {0}
    end
end

local out = {1}
for _, v in ipairs(redis.call('HGETALL', KEYS[1])) do
    out[#out + 1] = v
end
redis.call('DEL', KEYS[1])
return out
"#;

/// Fixed-window counter consume.
///
/// Arguments:
/// - KEYS[1]: Counter key
/// - ARGV[1]: Now (epoch milliseconds)
/// - ARGV[2]: Window length (milliseconds)
/// - ARGV[3]: Expiry for a newly opened window (epoch seconds)
///
/// Returns:
/// - {count, window_start}: Counter state after this consume
pub const CONSUME_WINDOW: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local start = tonumber(redis.call('HGET', KEYS[1], 'windowStart'))

if start == nil or now >= start + window then
    redis.call('DEL', KEYS[1])
    redis.call('HSET', KEYS[1], 'count', 1, 'windowStart', ARGV[1])
    redis.call('EXPIREAT', KEYS[1], ARGV[3])
    return {1, now}
end

local count = redis.call('HINCRBY', KEYS[1], 'count', 1)
return {count, start}
"#;
