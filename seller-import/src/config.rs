use common_amqp::AmqpConfig;
use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // CSV when the file ends in .csv, newline-delimited JSON otherwise
    #[envconfig(from = "IMPORT_FILE_PATH")]
    pub import_file_path: String,

    #[envconfig(nested = true)]
    pub amqp: AmqpConfig,
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_file_path_is_required() {
        assert!(Config::init_from_hashmap(&HashMap::new()).is_err());

        let env = HashMap::from([
            ("IMPORT_FILE_PATH".to_string(), "/tmp/sellers.ndjson".to_string()),
            ("AMQP_PUBLISH_BATCH_SIZE".to_string(), "250".to_string()),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();

        assert_eq!(config.import_file_path, "/tmp/sellers.ndjson");
        assert_eq!(config.amqp.publisher_config().batch_size(), 250);
    }
}
