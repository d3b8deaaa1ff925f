pub mod http_quote_source;
