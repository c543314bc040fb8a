//! Topic template resolution and MQTT client ID sanitization.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{BrokerConfig, Config};

static DISALLOWED_CLIENT_ID_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-zA-Z0-9_-]").unwrap());

/// Look up a broker's config by index, if present.
pub fn get_broker_config(config: &Config, broker_idx: usize) -> Option<&BrokerConfig> {
    config.broker.get(broker_idx)
}

/// Substitute `{IATA}` and `{PUBLIC_KEY}` placeholders in a topic template.
pub fn resolve_topic_template(template: &str, iata: &str, repeater_pub_key: Option<&str>) -> String {
    if template.is_empty() {
        return String::new();
    }
    let pub_key = repeater_pub_key.unwrap_or("UNKNOWN");
    template
        .replace("{IATA}", iata)
        .replace("{PUBLIC_KEY}", pub_key)
}

/// Resolve a topic of `topic_type` ("packets", "status", "debug") for the
/// given broker, falling back to the global topic template when the broker
/// doesn't override it. `{IATA}` resolves to the broker's own `topics.iata`
/// override if non-empty, else the global `general.iata`. An empty
/// resulting template suppresses publication.
pub fn get_topic(
    config: &Config,
    broker_idx: usize,
    topic_type: &str,
    repeater_pub_key: Option<&str>,
) -> String {
    let broker = get_broker_config(config, broker_idx);

    let iata = broker
        .map(|b| b.topics.iata.as_str())
        .filter(|iata| !iata.is_empty())
        .unwrap_or(config.general.iata.as_str());

    let broker_template = broker.and_then(|b| template_for(&b.topics, topic_type));
    let template = broker_template
        .filter(|t| !t.is_empty())
        .or_else(|| template_for(&config.topics, topic_type))
        .unwrap_or_default();

    resolve_topic_template(template, iata, repeater_pub_key)
}

fn template_for<'a>(templates: &'a crate::config::TopicTemplates, topic_type: &str) -> Option<&'a str> {
    match topic_type {
        "packets" => Some(templates.packets.as_str()),
        "status" => Some(templates.status.as_str()),
        "debug" => Some(templates.debug.as_str()),
        _ => None,
    }
}

/// The fixed inbound command topic for this node. Literal, not routed
/// through broker/global topic overrides.
pub fn serial_commands_topic(iata: &str, repeater_pub_key: &str) -> String {
    format!("meshcore/{iata}/{repeater_pub_key}/serial/commands")
}

/// The fixed outbound response topic for this node. Literal, broadcast to
/// every connected broker rather than targeted at the originating one.
pub fn serial_responses_topic(iata: &str, repeater_pub_key: &str) -> String {
    format!("meshcore/{iata}/{repeater_pub_key}/serial/responses")
}

/// Produce an MQTT-safe client id: prefix + name with spaces turned into
/// underscores, disallowed characters stripped, truncated to 23 bytes (the
/// MQTT 3.1.1 client-id length limit some brokers still enforce).
pub fn sanitize_client_id(name: &str, prefix: &str) -> String {
    let with_prefix = format!("{prefix}{}", name.replace(' ', "_"));
    let cleaned = DISALLOWED_CLIENT_ID_CHARS.replace_all(&with_prefix, "");
    cleaned.chars().take(23).collect()
}

/// Build the client id for a given broker index. The prefix is always
/// sourced from the *first configured broker's* `client_id_prefix`,
/// regardless of which broker is being (re)connected — preserved from the
/// original bridge rather than "fixed", since brokers rarely disagree on it
/// in practice and changing the coupling would be an unrequested behavior
/// change.
pub fn client_id_for_broker(config: &Config, broker_idx: usize, repeater_pub_key: &str) -> String {
    let prefix = config
        .broker
        .first()
        .map(|b| b.client_id_prefix.as_str())
        .unwrap_or("meshcore_");
    let mut id = sanitize_client_id(repeater_pub_key, prefix);
    if broker_idx > 0 {
        id.push_str(&format!("_{broker_idx}"));
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_both_placeholders() {
        let resolved = resolve_topic_template("meshcore/{IATA}/{PUBLIC_KEY}/packets", "CDG", Some("ABCD"));
        assert_eq!(resolved, "meshcore/CDG/ABCD/packets");
    }

    #[test]
    fn falls_back_to_unknown_public_key() {
        let resolved = resolve_topic_template("meshcore/{IATA}/{PUBLIC_KEY}/packets", "CDG", None);
        assert_eq!(resolved, "meshcore/CDG/UNKNOWN/packets");
    }

    #[test]
    fn empty_template_resolves_to_empty_string() {
        assert_eq!(resolve_topic_template("", "CDG", Some("ABCD")), "");
    }

    #[test]
    fn sanitize_strips_spaces_and_illegal_chars() {
        let id = sanitize_client_id("My Repeater! #1", "meshcore_");
        assert_eq!(id, "meshcore_My_Repeater_1");
    }

    #[test]
    fn sanitize_truncates_to_23_chars() {
        let id = sanitize_client_id("a-very-long-repeater-name-indeed", "meshcore_");
        assert_eq!(id.len(), 23);
    }

    #[test]
    fn broker_topic_override_beats_global_template() {
        let mut config = Config::default();
        config.topics.packets = "global/{IATA}/packets".to_string();
        let mut broker = crate::config::BrokerConfig::default();
        broker.topics.packets = "custom/{IATA}/packets".to_string();
        config.broker.push(broker);

        let topic = get_topic(&config, 0, "packets", None);
        assert_eq!(topic, "custom/UNKNOWN/packets");
    }

    #[test]
    fn falls_back_to_global_template_when_broker_has_no_override() {
        let mut config = Config::default();
        config.topics.status = "global/{IATA}/status".to_string();
        config.broker.push(crate::config::BrokerConfig::default());

        let topic = get_topic(&config, 0, "status", None);
        assert_eq!(topic, "global/UNKNOWN/status");
    }

    #[test]
    fn broker_iata_override_wins_over_global_iata() {
        let mut config = Config::default();
        config.general.iata = "XXX".to_string();
        config.topics.status = "meshcore/{IATA}/status".to_string();
        let mut broker = crate::config::BrokerConfig::default();
        broker.topics.iata = "CDG".to_string();
        config.broker.push(broker);

        let topic = get_topic(&config, 0, "status", None);
        assert_eq!(topic, "meshcore/CDG/status");
    }

    #[test]
    fn serial_topics_are_literal() {
        assert_eq!(
            serial_commands_topic("CDG", "AA"),
            "meshcore/CDG/AA/serial/commands"
        );
        assert_eq!(
            serial_responses_topic("CDG", "AA"),
            "meshcore/CDG/AA/serial/responses"
        );
    }

    #[test]
    fn client_id_appends_broker_index_beyond_the_first() {
        let mut config = Config::default();
        config.broker.push(crate::config::BrokerConfig {
            client_id_prefix: "meshcore_".to_string(),
            ..Default::default()
        });
        config.broker.push(crate::config::BrokerConfig {
            client_id_prefix: "ignored_".to_string(),
            ..Default::default()
        });

        assert_eq!(
            client_id_for_broker(&config, 0, "ABCDEF0123456789"),
            "meshcore_ABCDEF0123456789"
        );
        assert_eq!(
            client_id_for_broker(&config, 1, "ABCDEF0123456789"),
            "meshcore_ABCDEF0123456789_1"
        );
    }
}
