use doqfwd_domain::Config;
use doqfwd_infrastructure::dns::forwarding::{MessageBuilder, ResponseParser};
use doqfwd_infrastructure::dns::transport::{DnsUpstream, DoqUpstream};
use std::time::Instant;
use tracing::debug;

/// Resolves one name through the configured upstream and prints the answer.
pub async fn run_query(config: &Config, domain: &str, record_type: &str) -> anyhow::Result<()> {
    let record_type = MessageBuilder::parse_record_type(record_type)?;
    let query = MessageBuilder::build_query(domain, record_type)?;
    let upstream = DoqUpstream::from_config(&config.upstream)?;

    let started = Instant::now();
    let result = tokio::time::timeout(config.upstream.query_timeout(), upstream.exchange(&query)).await;
    let elapsed = started.elapsed();
    upstream.close();

    let response = match result {
        Ok(response) => response?,
        Err(_) => anyhow::bail!("query to {} timed out", upstream.target()),
    };
    let parsed = ResponseParser::parse(&response);
    debug!(stats = ?upstream.buffer_stats(), "Buffer pool");

    println!(
        ";; {} {} via {}: {} in {} ms",
        domain,
        record_type,
        upstream.target(),
        ResponseParser::rcode_to_status(parsed.rcode),
        elapsed.as_millis()
    );
    for record in response.answers() {
        println!("{}", record);
    }
    if parsed.is_nodata() {
        println!(";; no records");
    }
    if parsed.truncated {
        println!(";; response truncated");
    }
    Ok(())
}
