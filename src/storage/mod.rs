pub mod encoded_key;
