pub mod directive_service;
