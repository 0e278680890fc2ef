#![allow(clippy::uninlined_format_args)]

use spf_policyd::spf::DnsSpfResolver;
use spf_policyd::{AuthenticationResolver, Config, IdentityRequest, Scope};

/// Check identities against live DNS.
///
/// Usage: test-policy-query <client-ip> <helo> [sender...]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 2 {
        println!("Usage: test-policy-query <client-ip> <helo> [sender...]");
        return Ok(());
    }
    let client_ip = &args[0];
    let helo = &args[1];

    let resolver = DnsSpfResolver::from_config(&Config::default())?;

    let mut requests = vec![IdentityRequest::new(Scope::Helo, helo, client_ip, None)];
    for sender in &args[2..] {
        requests.push(IdentityRequest::new(
            Scope::MailFrom,
            sender,
            client_ip,
            Some(helo),
        ));
    }

    for request in requests {
        let request = match request {
            Ok(request) => request,
            Err(e) => {
                println!("❌ Invalid request: {}", e);
                continue;
            }
        };

        println!("\n=== {} {} from {} ===", request.scope, request.identity, request.client_ip);
        let result = resolver.check(&request).await;
        println!("  Result: {}", result.code);
        println!("  Local explanation: {}", result.local_explanation);
        if !result.authority_explanation.is_empty() {
            println!("  Authority explanation: {}", result.authority_explanation);
        }
        println!("  {}", result.header);
    }

    Ok(())
}
