pub mod xenograft;
