mod redis_sink;

pub use redis_sink::RedisEventSink;
