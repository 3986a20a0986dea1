mod events;
mod readings;
