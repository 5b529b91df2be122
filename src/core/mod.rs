pub mod database;
pub mod player;
pub mod script;
pub mod shadow;
pub mod variables;
